#![forbid(unsafe_code)]

//! `agent-foreman` — coding-agent orchestration engine.
//!
//! Turns an epic's flat work-item list into ordered phases and drives
//! each item to completion through an agent CLI subprocess, reporting
//! progress to an external tracking service.

pub mod agent;
pub mod config;
pub mod errors;
pub mod plan;
pub mod retry;
pub mod session;
pub mod tracker;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
