//! Global configuration parsing, validation, and credential loading.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::args::PromptOptions;
use crate::{AppError, Result};

/// Environment variable holding the tracking-service API token.
///
/// Credentials are loaded at runtime from the environment, never from
/// the TOML config file.
pub const TRACKER_TOKEN_VAR: &str = "FOREMAN_TRACKER_TOKEN";

/// Agent subprocess configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent CLI binary, resolved via `PATH` unless absolute.
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Default model identifier.
    #[serde(default)]
    pub model: Option<String>,
    /// Default working directory for spawned agents.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Overall per-request deadline.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Inactivity watchdog threshold; resets on every stream event.
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
    /// Pass `--dangerously-skip-permissions` to the agent.
    #[serde(default)]
    pub skip_permissions: bool,
    /// MCP configuration file forwarded to the agent.
    #[serde(default)]
    pub mcp_config: Option<PathBuf>,
    /// Full system-prompt override.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Text appended to the agent's default system prompt.
    #[serde(default)]
    pub append_system_prompt: Option<String>,
    /// Cap on agent turns per prompt.
    #[serde(default)]
    pub max_turns: Option<u32>,
    /// Tool allow-list.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Raw arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Environment variable overrides for spawned agents.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            model: None,
            working_dir: None,
            request_timeout_ms: default_request_timeout_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            skip_permissions: false,
            mcp_config: None,
            system_prompt: None,
            append_system_prompt: None,
            max_turns: None,
            allowed_tools: Vec::new(),
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Overall request deadline as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Inactivity watchdog threshold as a [`Duration`].
    #[must_use]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Default [`PromptOptions`] derived from this configuration.
    #[must_use]
    pub fn prompt_options(&self) -> PromptOptions {
        PromptOptions {
            model: self.model.clone(),
            working_dir: self.working_dir.clone(),
            system_prompt: self.system_prompt.clone(),
            append_system_prompt: self.append_system_prompt.clone(),
            skip_permissions: self.skip_permissions,
            max_turns: self.max_turns,
            allowed_tools: self.allowed_tools.clone(),
            mcp_config: self.mcp_config.clone(),
            extra_args: self.extra_args.clone(),
            env: HashMap::new(),
            request_timeout: None,
            inactivity_timeout: None,
        }
    }
}

fn default_executable() -> String {
    "claude".into()
}

fn default_request_timeout_ms() -> u64 {
    300_000
}

fn default_inactivity_timeout_ms() -> u64 {
    60_000
}

/// Tracking-service connectivity.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TrackerConfig {
    /// Base URL of the tracking service.
    pub base_url: String,
    /// API token (populated at runtime from the environment).
    #[serde(skip)]
    pub api_token: Option<String>,
    /// Per-request HTTP timeout.
    #[serde(default = "default_tracker_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_tracker_timeout_ms() -> u64 {
    30_000
}

/// Execution-run knobs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    /// Halt the run when a phase finishes with zero successful items.
    #[serde(default = "default_true")]
    pub halt_on_failed_phase: bool,
    /// Caller-side ceiling for one item's agent run, layered above the
    /// client's own timers. `None` means wait for the client to settle.
    #[serde(default)]
    pub item_timeout_ms: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            halt_on_failed_phase: true,
            item_timeout_ms: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent subprocess settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Tracking-service connectivity.
    pub tracker: TrackerConfig,
    /// Execution-run knobs.
    #[serde(default)]
    pub run: RunConfig,
}

impl GlobalConfig {
    /// Parse and validate a TOML configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] for syntax errors or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.agent.executable.trim().is_empty() {
            return Err(AppError::Config("agent.executable must not be empty".into()));
        }
        if self.agent.request_timeout_ms == 0 {
            return Err(AppError::Config(
                "agent.request_timeout_ms must be positive".into(),
            ));
        }
        if self.agent.inactivity_timeout_ms == 0 {
            return Err(AppError::Config(
                "agent.inactivity_timeout_ms must be positive".into(),
            ));
        }
        let url = self.tracker.base_url.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(AppError::Config(format!(
                "tracker.base_url must be an http(s) URL, got `{url}`"
            )));
        }
        Ok(())
    }

    /// Load the tracker API token from the environment, if set.
    pub fn load_credentials(&mut self) {
        if let Ok(token) = env::var(TRACKER_TOKEN_VAR) {
            if !token.is_empty() {
                self.tracker.api_token = Some(token);
            }
        }
    }
}
