//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes that are never retried, regardless of the policy's
/// retryable set. Takes precedence when a code appears in both.
pub const NON_RETRYABLE_CODES: &[&str] = &[
    "AUTH_FAILED",
    "NOT_FOUND",
    "VALIDATION_ERROR",
    "CONFIG_ERROR",
    "SESSION_MISUSE",
];

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Authentication or authorization rejection.
    Auth(String),
    /// Transport-level failure reaching a remote service. The network
    /// layer decides retryability at construction time: connection and
    /// timeout failures are retryable, definitive rejections are not.
    Network {
        /// Human-readable failure description.
        message: String,
        /// Whether the failure class is worth retrying.
        retryable: bool,
    },
    /// Tracking-service API error with the HTTP status preserved.
    Tracker {
        /// HTTP status code returned by the service.
        status: u16,
        /// Response body, kept verbatim for diagnostics.
        message: String,
    },
    /// Agent subprocess launch, protocol, or exit failure.
    Agent(String),
    /// Stream framing failure (e.g. oversized NDJSON line).
    Stream(String),
    /// Agent run exceeded the overall request deadline.
    Timeout(String),
    /// Agent run exceeded the inactivity watchdog.
    Stalled(String),
    /// Session misuse (send while working, send after destroy).
    Session(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Input failed validation.
    Validation(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Stable machine-readable code, consumed by the retry classifier.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Auth(_) => "AUTH_FAILED",
            Self::Network { .. } => "NETWORK_ERROR",
            Self::Tracker { .. } => "TRACKER_API_ERROR",
            Self::Agent(_) => "AGENT_PROCESS_ERROR",
            Self::Stream(_) => "STREAM_ERROR",
            Self::Timeout(_) => "AGENT_TIMEOUT",
            Self::Stalled(_) => "AGENT_STALLED",
            Self::Session(_) => "SESSION_MISUSE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Auth(msg) => write!(f, "auth: {msg}"),
            Self::Network { message, .. } => write!(f, "network: {message}"),
            Self::Tracker { status, message } => write!(f, "tracker ({status}): {message}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Stream(msg) => write!(f, "stream: {msg}"),
            Self::Timeout(msg) => write!(f, "timed out: {msg}"),
            Self::Stalled(msg) => write!(f, "inactive: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
