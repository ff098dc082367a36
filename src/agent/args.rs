//! CLI argument construction for the agent subprocess.
//!
//! [`build_arguments`] is deliberately a pure function: the full argument
//! vector is derived from the prompt and options alone, with no
//! environment reads, so it can be tested without spawning anything.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Per-invocation configuration for one agent prompt cycle.
///
/// Unset fields fall back to the client-level [`AgentConfig`](crate::config::AgentConfig)
/// defaults where one exists (working directory, timeouts).
#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    /// Model identifier forwarded as `--model`.
    pub model: Option<String>,
    /// Working directory for the spawned process (not an argument).
    pub working_dir: Option<PathBuf>,
    /// Full system-prompt override (`--system-prompt`).
    pub system_prompt: Option<String>,
    /// Text appended to the default system prompt (`--append-system-prompt`).
    pub append_system_prompt: Option<String>,
    /// Pass `--dangerously-skip-permissions`.
    pub skip_permissions: bool,
    /// Cap on agent turns (`--max-turns`).
    pub max_turns: Option<u32>,
    /// Tool allow-list, joined with commas for `--allowedTools`.
    pub allowed_tools: Vec<String>,
    /// MCP configuration file path (`--mcp-config`).
    pub mcp_config: Option<PathBuf>,
    /// Raw arguments appended after all structured options.
    pub extra_args: Vec<String>,
    /// Extra environment variables for the spawned process.
    pub env: HashMap<String, String>,
    /// Overall deadline override for this call.
    pub request_timeout: Option<Duration>,
    /// Inactivity watchdog override for this call.
    pub inactivity_timeout: Option<Duration>,
}

/// Map a prompt and options onto the agent CLI's argument vector.
///
/// The output always starts with
/// `--print <prompt> --output-format stream-json`; every set option is
/// present verbatim, in a fixed order, with `extra_args` appended last.
#[must_use]
pub fn build_arguments(prompt: &str, options: &PromptOptions) -> Vec<String> {
    let mut args = vec![
        "--print".to_owned(),
        prompt.to_owned(),
        "--output-format".to_owned(),
        "stream-json".to_owned(),
    ];

    if options.skip_permissions {
        args.push("--dangerously-skip-permissions".to_owned());
    }
    if let Some(model) = &options.model {
        args.push("--model".to_owned());
        args.push(model.clone());
    }
    if let Some(path) = &options.mcp_config {
        args.push("--mcp-config".to_owned());
        args.push(path.display().to_string());
    }
    if let Some(prompt) = &options.system_prompt {
        args.push("--system-prompt".to_owned());
        args.push(prompt.clone());
    }
    if let Some(prompt) = &options.append_system_prompt {
        args.push("--append-system-prompt".to_owned());
        args.push(prompt.clone());
    }
    if let Some(turns) = options.max_turns {
        args.push("--max-turns".to_owned());
        args.push(turns.to_string());
    }
    if !options.allowed_tools.is_empty() {
        args.push("--allowedTools".to_owned());
        args.push(options.allowed_tools.join(","));
    }

    args.extend(options.extra_args.iter().cloned());
    args
}
