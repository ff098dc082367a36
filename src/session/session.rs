//! Stateful session wrapper enforcing at-most-one in-flight prompt.
//!
//! A session forwards the client's incremental notifications to its
//! subscribers over a broadcast channel, in the order received. Status
//! moves `Idle → Working → {Completed | Failed}`; `cancel` returns to
//! `Idle` for reuse, `destroy` is terminal. Settlement of a cancelled or
//! destroyed invocation is dropped via an epoch check — a stale result
//! is never delivered as success.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::agent::args::PromptOptions;
use crate::agent::client::{AgentClient, PromptOutcome};
use crate::agent::events::AgentNotification;
use crate::{AppError, Result};

/// Capacity of the per-session broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No invocation in flight; `send` is accepted.
    Idle,
    /// An invocation is in flight; `send` is rejected.
    Working,
    /// Terminal: last invocation succeeded, or the session was destroyed.
    Completed,
    /// Terminal: last invocation failed.
    Failed,
}

/// Events re-emitted on a session's broadcast channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Incremental assistant text.
    Text {
        /// Message this event belongs to.
        message_id: String,
        /// The text fragment.
        content: String,
    },
    /// Tool invocation by the agent.
    ToolCall {
        /// Message this event belongs to.
        message_id: String,
        /// Tool name.
        name: String,
        /// Structured tool input.
        input: serde_json::Value,
    },
    /// Tool result echoed by the agent.
    ToolResult {
        /// Message this event belongs to.
        message_id: String,
        /// Flattened result text.
        content: String,
        /// Whether the tool reported an error.
        is_error: bool,
    },
    /// One stderr line from the subprocess.
    Diagnostic {
        /// Message this event belongs to.
        message_id: String,
        /// The stderr line, verbatim.
        line: String,
    },
    /// A stream line was dropped by the parser.
    Warning {
        /// Message this event belongs to.
        message_id: String,
        /// Why the line was dropped.
        detail: String,
    },
    /// The invocation settled successfully.
    Completed {
        /// Message that settled.
        message_id: String,
        /// Final result text.
        result_text: String,
    },
    /// The invocation settled with an error.
    Failed {
        /// Message that settled.
        message_id: String,
        /// The classified failure.
        error: AppError,
    },
}

struct SessionState {
    status: SessionStatus,
    /// Bumped on every send/cancel/destroy; a settling invocation whose
    /// epoch no longer matches is dropped silently.
    epoch: u64,
}

/// A cancellable, observable unit of work over the agent client.
pub struct Session {
    id: String,
    client: Arc<AgentClient>,
    options: PromptOptions,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Construct an idle session. Sessions are created through the
    /// [`SessionManager`](crate::session::SessionManager).
    #[must_use]
    pub(crate) fn new(id: String, client: Arc<AgentClient>, options: PromptOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            id,
            client,
            options,
            state: Mutex::new(SessionState {
                status: SessionStatus::Idle,
                epoch: 0,
            }),
            events,
        })
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    /// Subscribe to this session's event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Begin a prompt asynchronously and return its message identifier
    /// immediately. Completion is announced via
    /// [`SessionEvent::Completed`] / [`SessionEvent::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Session`] if the session is already working,
    /// or is in a terminal status (completed, failed, destroyed).
    pub fn send(self: &Arc<Self>, prompt: &str) -> Result<String> {
        let epoch = {
            let mut state = self.lock_state();
            match state.status {
                SessionStatus::Working => {
                    return Err(AppError::Session(format!(
                        "session {} is already working",
                        self.id
                    )));
                }
                SessionStatus::Completed => {
                    return Err(AppError::Session(format!(
                        "session {} cannot send in status completed",
                        self.id
                    )));
                }
                SessionStatus::Failed => {
                    return Err(AppError::Session(format!(
                        "session {} cannot send in status failed",
                        self.id
                    )));
                }
                SessionStatus::Idle => {}
            }
            state.status = SessionStatus::Working;
            state.epoch += 1;
            state.epoch
        };

        let message_id = Uuid::new_v4().to_string();

        let (notif_tx, notif_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let forwarder = Arc::clone(self);
        tokio::spawn(forward_notifications(
            forwarder,
            epoch,
            message_id.clone(),
            notif_rx,
        ));

        let runner = Arc::clone(self);
        let prompt = prompt.to_owned();
        let settle_id = message_id.clone();
        tokio::spawn(async move {
            let outcome = runner
                .client
                .execute_prompt(&prompt, &runner.options, notif_tx)
                .await;
            runner.settle(epoch, &settle_id, outcome);
        });

        Ok(message_id)
    }

    /// Send a prompt and wait for its settlement.
    ///
    /// `timeout` is a caller-side limit layered above the client's own
    /// timers: expiring only stops waiting — the underlying invocation
    /// may still settle later and is then swallowed by the epoch check
    /// when the caller cancels or destroys the session.
    ///
    /// # Errors
    ///
    /// Propagates `send` errors, the invocation's failure, or
    /// [`AppError::Timeout`] if `timeout` elapses first.
    pub async fn send_and_wait(
        self: &Arc<Self>,
        prompt: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let mut rx = self.events.subscribe();
        let message_id = self.send(prompt)?;

        let wait = async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Completed {
                        message_id: settled,
                        result_text,
                    }) if settled == message_id => return Ok(result_text),
                    Ok(SessionEvent::Failed {
                        message_id: settled,
                        error,
                    }) if settled == message_id => return Err(error),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "session event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(AppError::Session("session event channel closed".into()));
                    }
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                AppError::Timeout(format!(
                    "timed out after {}ms waiting for session {}",
                    limit.as_millis(),
                    self.id
                ))
            })?,
            None => wait.await,
        }
    }

    /// Return the session to `Idle` without destroying it.
    ///
    /// Does not kill an in-flight subprocess; its eventual settlement is
    /// dropped rather than delivered.
    pub fn cancel(&self) {
        let mut state = self.lock_state();
        state.epoch += 1;
        state.status = SessionStatus::Idle;
    }

    /// Terminal teardown: status becomes `Completed` and no further
    /// events are delivered. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.lock_state();
        state.epoch += 1;
        state.status = SessionStatus::Completed;
    }

    fn settle(&self, epoch: u64, message_id: &str, outcome: Result<PromptOutcome>) {
        let event = {
            let mut state = self.lock_state();
            if state.epoch != epoch || state.status != SessionStatus::Working {
                debug!(
                    session_id = %self.id,
                    "invocation settled after cancel or destroy; dropping result"
                );
                return;
            }
            match outcome {
                Ok(outcome) => {
                    state.status = SessionStatus::Completed;
                    SessionEvent::Completed {
                        message_id: message_id.to_owned(),
                        result_text: outcome.result_text,
                    }
                }
                Err(error) => {
                    state.status = SessionStatus::Failed;
                    SessionEvent::Failed {
                        message_id: message_id.to_owned(),
                        error,
                    }
                }
            }
        };
        let _ = self.events.send(event);
    }

    fn epoch_is_current(&self, epoch: u64) -> bool {
        self.lock_state().epoch == epoch
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Re-emit client notifications on the session channel, in order, until
/// the invocation's epoch goes stale (cancel/destroy) or the stream ends.
async fn forward_notifications(
    session: Arc<Session>,
    epoch: u64,
    message_id: String,
    mut notifications: mpsc::Receiver<AgentNotification>,
) {
    while let Some(notification) = notifications.recv().await {
        if !session.epoch_is_current(epoch) {
            break;
        }
        let event = match notification {
            AgentNotification::Text { content } => SessionEvent::Text {
                message_id: message_id.clone(),
                content,
            },
            AgentNotification::ToolCall { name, input } => SessionEvent::ToolCall {
                message_id: message_id.clone(),
                name,
                input,
            },
            AgentNotification::ToolResult { content, is_error } => SessionEvent::ToolResult {
                message_id: message_id.clone(),
                content,
                is_error,
            },
            AgentNotification::Diagnostic { line } => SessionEvent::Diagnostic {
                message_id: message_id.clone(),
                line,
            },
            AgentNotification::Warning { detail, .. } => SessionEvent::Warning {
                message_id: message_id.clone(),
                detail,
            },
        };
        // A send error only means no subscriber is currently attached.
        let _ = session.events.send(event);
    }
}
