//! Session layer: single-in-flight prompt semantics over the agent
//! client, plus the registry that owns every live session.

pub mod manager;
#[allow(clippy::module_inception)]
pub mod session;

pub use manager::{SessionManager, SessionOptions};
pub use session::{Session, SessionEvent, SessionStatus};
