//! Coding-agent subprocess handling.
//!
//! One prompt-to-completion cycle maps to one spawned agent CLI process
//! speaking newline-delimited JSON on stdout. Submodules:
//! - `args`: pure CLI argument construction.
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based stream framing with a line-length cap.
//! - `events`: typed stream events and incremental notifications.
//! - `parser`: chunk-tolerant NDJSON event parsing.
//! - `client`: process spawning, dual-timer supervision, signal escalation.

pub mod args;
pub mod client;
pub mod codec;
pub mod events;
pub mod parser;
