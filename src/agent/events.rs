//! Typed events decoded from the agent's `stream-json` stdout protocol,
//! and the incremental notifications derived from them.
//!
//! The wire protocol is a tagged union on the `type` field. Unknown
//! variants decode to [`StreamEvent::Unknown`] so a newer agent binary
//! can never break decoding — the parser turns those into warnings.

use serde::Deserialize;
use serde_json::Value;

// ── Wire events ───────────────────────────────────────────────────────────────

/// One decoded line of the agent's NDJSON stdout stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Assistant turn carrying ordered content blocks.
    Assistant {
        /// Message payload with content, model, and stop reason.
        message: AssistantMessage,
    },
    /// Tool results echoed back between assistant turns.
    User {
        /// Message payload carrying `tool_result` blocks.
        message: UserMessage,
    },
    /// Terminal event; exactly one ends a well-formed invocation.
    Result {
        /// Success or error discriminator.
        subtype: ResultSubtype,
        /// Final result text.
        #[serde(default)]
        result: Option<String>,
        /// Total cost of the run in USD.
        #[serde(default)]
        total_cost_usd: Option<f64>,
        /// Wall-clock duration reported by the agent.
        #[serde(default)]
        duration_ms: Option<u64>,
        /// Number of agent turns consumed.
        #[serde(default)]
        num_turns: Option<u32>,
        /// Agent-side session identifier.
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Informational event (init banner, notices).
    System {
        /// Event subtype (e.g. `init`).
        #[serde(default)]
        subtype: Option<String>,
        /// Free-text message, when present.
        #[serde(default)]
        message: Option<String>,
        /// Agent-side session identifier, when present.
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Any `type` value this build does not recognize.
    #[serde(other)]
    Unknown,
}

/// Discriminator on `result` events. Every non-`success` subtype the
/// agent emits (`error_max_turns`, `error_during_execution`, …) maps to
/// [`ResultSubtype::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSubtype {
    /// The run completed successfully.
    Success,
    /// The run failed; the result text carries the reason.
    Error,
}

impl<'de> Deserialize<'de> for ResultSubtype {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let subtype = String::deserialize(deserializer)?;
        Ok(if subtype == "success" {
            Self::Success
        } else {
            Self::Error
        })
    }
}

/// Payload of an `assistant` event.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    /// Ordered content blocks.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Model identifier that produced the turn.
    #[serde(default)]
    pub model: Option<String>,
    /// Why the turn ended, when reported.
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Payload of a `user` event.
#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    /// Ordered content blocks; only `tool_result` is meaningful here.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// One content block inside an assistant or user message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text produced by the model.
    Text {
        /// The text fragment.
        text: String,
    },
    /// Tool invocation requested by the model.
    ToolUse {
        /// Tool name.
        name: String,
        /// Structured tool input.
        #[serde(default)]
        input: Value,
    },
    /// Result of a prior tool invocation.
    ToolResult {
        /// Result content: a string or an array of text parts.
        #[serde(default)]
        content: Value,
        /// Whether the tool reported an error.
        #[serde(default)]
        is_error: bool,
    },
    /// Block type this build does not recognize; skipped silently.
    #[serde(other)]
    Other,
}

/// Flatten a `tool_result` content value to plain text. The agent emits
/// either a bare string or an array of `{type: "text", text}` parts.
#[must_use]
pub fn collect_tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

// ── Notifications ─────────────────────────────────────────────────────────────

/// Classification of a dropped stream line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// The line was not valid JSON or had an unrecognized `type`.
    MalformedJson,
    /// The line exceeded the codec's length cap and was discarded.
    OversizedLine,
}

/// Incremental notifications emitted to subscribers while a prompt
/// executes, in the order the subprocess produced them.
#[derive(Debug, Clone)]
pub enum AgentNotification {
    /// A text content block from an assistant turn.
    Text {
        /// The text fragment.
        content: String,
    },
    /// A tool invocation from an assistant turn.
    ToolCall {
        /// Tool name.
        name: String,
        /// Structured tool input.
        input: Value,
    },
    /// A tool result from a user turn.
    ToolResult {
        /// Flattened result text.
        content: String,
        /// Whether the tool reported an error.
        is_error: bool,
    },
    /// One line of the subprocess's stderr, verbatim.
    Diagnostic {
        /// The stderr line.
        line: String,
    },
    /// A stream line was dropped.
    Warning {
        /// Why the line was dropped.
        kind: WarningKind,
        /// Parse context for diagnostics.
        detail: String,
    },
}
