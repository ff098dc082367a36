//! Process-driving client for the coding-agent CLI.
//!
//! Runs exactly one prompt-to-completion cycle per call: spawns the
//! agent executable with arguments from [`build_arguments`], parses its
//! stdout incrementally, and supervises the run under two independent
//! timers — an overall request deadline and an inactivity watchdog that
//! resets on every parsed stream event. Either timer expiring delivers
//! `SIGTERM`, then `SIGKILL` after a grace window. No retry, no queuing;
//! callers layer those via [`retry`](crate::retry).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::agent::args::{build_arguments, PromptOptions};
use crate::agent::codec::StreamCodec;
use crate::agent::events::{
    collect_tool_result_text, AgentNotification, ContentBlock, ResultSubtype, StreamEvent,
    WarningKind,
};
use crate::agent::parser::{parse_event_line, ParsedLine};
use crate::config::AgentConfig;
use crate::{AppError, Result};

/// Grace window between `SIGTERM` and `SIGKILL`.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long a process may linger after emitting its `result` event.
const RESULT_EXIT_GRACE: Duration = Duration::from_secs(10);

/// Final result of a successful prompt cycle.
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    /// Final result text from the agent.
    pub result_text: String,
    /// Total cost in USD, when reported.
    pub cost_usd: Option<f64>,
    /// Run duration in milliseconds, when reported.
    pub duration_ms: Option<u64>,
    /// Agent turns consumed, when reported.
    pub num_turns: Option<u32>,
    /// Agent-side session identifier, when reported.
    pub agent_session_id: Option<String>,
}

/// Fields of the terminal `result` event, carried out of the stream loop.
#[derive(Debug)]
struct FinalResult {
    subtype: ResultSubtype,
    result: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    num_turns: Option<u32>,
    session_id: Option<String>,
}

/// Terminal state of the stdout supervision loop.
#[derive(Debug)]
enum StreamVerdict {
    /// A `result` event arrived.
    Finished(FinalResult),
    /// stdout closed without a `result` event.
    StreamEnded,
    /// The overall request deadline expired.
    DeadlineExpired,
    /// The inactivity watchdog expired.
    WatchdogExpired,
}

/// Stateless client: one spawned OS process per [`execute_prompt`](Self::execute_prompt) call.
#[derive(Debug, Clone)]
pub struct AgentClient {
    config: AgentConfig,
}

impl AgentClient {
    /// Create a client over the given agent configuration.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run one prompt to completion.
    ///
    /// Notifications (`text`, `tool_call`, `tool_result`, `diagnostic`,
    /// `warning`) stream through `notifications` as they arrive; the
    /// returned future resolves only once the run settles. Send failures
    /// on the channel are ignored so an abandoned subscriber never
    /// stalls the run.
    ///
    /// # Errors
    ///
    /// - [`AppError::Agent`] — spawn failure, missing stdout, error
    ///   `result` subtype, non-zero exit, or stream end without a
    ///   `result` event. Captured stderr is included verbatim.
    /// - [`AppError::Timeout`] — the overall deadline expired.
    /// - [`AppError::Stalled`] — the inactivity watchdog expired.
    pub async fn execute_prompt(
        &self,
        prompt: &str,
        options: &PromptOptions,
        notifications: mpsc::Sender<AgentNotification>,
    ) -> Result<PromptOutcome> {
        let argv = build_arguments(prompt, options);

        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&argv);
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        if let Some(dir) = options.working_dir.as_ref().or(self.config.working_dir.as_ref()) {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Agent(format!(
                "failed to spawn agent process `{}`: {err}",
                self.config.executable
            ))
        })?;

        info!(
            executable = %self.config.executable,
            pid = child.id().unwrap_or(0),
            "agent process spawned"
        );

        let stdout = child.stdout.take().ok_or_else(|| {
            AppError::Agent("agent process exposed no readable stdout stream".into())
        })?;

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_capture(stderr, Arc::clone(&stderr_buf), notifications.clone()));

        let deadline = options
            .request_timeout
            .unwrap_or_else(|| self.config.request_timeout());
        let watchdog = options
            .inactivity_timeout
            .unwrap_or_else(|| self.config.inactivity_timeout());

        let verdict = drive_stream(stdout, deadline, watchdog, &notifications).await;

        match verdict {
            StreamVerdict::Finished(end) => {
                let status = wait_or_terminate(&mut child, RESULT_EXIT_GRACE).await;
                let stderr_text = drain_stderr(stderr_task, &stderr_buf).await;
                settle_finished(end, status, &stderr_text)
            }
            StreamVerdict::StreamEnded => {
                let status = wait_or_terminate(&mut child, RESULT_EXIT_GRACE).await;
                let stderr_text = drain_stderr(stderr_task, &stderr_buf).await;
                Err(AppError::Agent(format!(
                    "agent stream ended without a result event ({}){}",
                    describe_exit(status),
                    stderr_suffix(&stderr_text)
                )))
            }
            StreamVerdict::DeadlineExpired => {
                terminate(&mut child, KILL_GRACE).await;
                let stderr_text = drain_stderr(stderr_task, &stderr_buf).await;
                Err(AppError::Timeout(format!(
                    "agent run exceeded the {}ms request deadline{}",
                    deadline.as_millis(),
                    stderr_suffix(&stderr_text)
                )))
            }
            StreamVerdict::WatchdogExpired => {
                terminate(&mut child, KILL_GRACE).await;
                let stderr_text = drain_stderr(stderr_task, &stderr_buf).await;
                Err(AppError::Stalled(format!(
                    "agent produced no stream events for {}ms{}",
                    watchdog.as_millis(),
                    stderr_suffix(&stderr_text)
                )))
            }
        }
    }
}

/// Combine the terminal `result` event with the process exit status.
fn settle_finished(
    end: FinalResult,
    status: Option<std::process::ExitStatus>,
    stderr_text: &str,
) -> Result<PromptOutcome> {
    let exited_clean = status.is_some_and(|s| s.success());

    if end.subtype == ResultSubtype::Success && exited_clean {
        return Ok(PromptOutcome {
            result_text: end.result.unwrap_or_default(),
            cost_usd: end.total_cost_usd,
            duration_ms: end.duration_ms,
            num_turns: end.num_turns,
            agent_session_id: end.session_id,
        });
    }

    // Prefer the agent's own result text, then stderr, for the rejection.
    let detail = end
        .result
        .filter(|text| !text.is_empty())
        .or_else(|| (!stderr_text.is_empty()).then(|| stderr_text.to_owned()))
        .unwrap_or_else(|| "no diagnostic output".to_owned());

    Err(AppError::Agent(format!(
        "agent run failed ({}): {detail}",
        describe_exit(status)
    )))
}

/// Drive the stdout stream under both timers until a terminal state.
///
/// The select is biased with the deadline first: an inactivity reset can
/// never extend a run past the overall deadline, and when both timers
/// have expired the deadline verdict wins.
async fn drive_stream<R>(
    stdout: R,
    deadline: Duration,
    watchdog: Duration,
    notifications: &mpsc::Sender<AgentNotification>,
) -> StreamVerdict
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(stdout, StreamCodec::new());
    let hard_deadline = Instant::now() + deadline;
    let idle = tokio::time::sleep(watchdog);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            () = tokio::time::sleep_until(hard_deadline) => return StreamVerdict::DeadlineExpired,

            () = &mut idle => return StreamVerdict::WatchdogExpired,

            item = framed.next() => match item {
                None => return StreamVerdict::StreamEnded,

                Some(Err(AppError::Stream(detail))) => {
                    // Oversized line: dropped by the codec; keep reading.
                    let _ = notifications
                        .send(AgentNotification::Warning {
                            kind: WarningKind::OversizedLine,
                            detail,
                        })
                        .await;
                }

                Some(Err(err)) => {
                    warn!(%err, "agent stdout read error, treating as end of stream");
                    return StreamVerdict::StreamEnded;
                }

                Some(Ok(line)) => match parse_event_line(&line) {
                    None => {}
                    Some(ParsedLine::Malformed { detail, context }) => {
                        debug!(detail = %detail, context = %context, "dropping malformed stream line");
                        let _ = notifications
                            .send(AgentNotification::Warning {
                                kind: WarningKind::MalformedJson,
                                detail,
                            })
                            .await;
                    }
                    Some(ParsedLine::Event(event)) => {
                        idle.as_mut().reset(Instant::now() + watchdog);
                        if let Some(end) = handle_event(event, notifications).await {
                            return StreamVerdict::Finished(end);
                        }
                    }
                },
            },
        }
    }
}

/// Emit notifications for one event; returns the terminal result fields
/// when the event is a `result`.
async fn handle_event(
    event: StreamEvent,
    notifications: &mpsc::Sender<AgentNotification>,
) -> Option<FinalResult> {
    match event {
        StreamEvent::Assistant { message } => {
            for block in message.content {
                match block {
                    ContentBlock::Text { text } => {
                        let _ = notifications
                            .send(AgentNotification::Text { content: text })
                            .await;
                    }
                    ContentBlock::ToolUse { name, input } => {
                        let _ = notifications
                            .send(AgentNotification::ToolCall { name, input })
                            .await;
                    }
                    ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
                }
            }
            None
        }
        StreamEvent::User { message } => {
            for block in message.content {
                if let ContentBlock::ToolResult { content, is_error } = block {
                    let _ = notifications
                        .send(AgentNotification::ToolResult {
                            content: collect_tool_result_text(&content),
                            is_error,
                        })
                        .await;
                }
            }
            None
        }
        StreamEvent::System { subtype, message, .. } => {
            debug!(
                subtype = subtype.as_deref().unwrap_or(""),
                message = message.as_deref().unwrap_or(""),
                "agent system event"
            );
            None
        }
        StreamEvent::Result {
            subtype,
            result,
            total_cost_usd,
            duration_ms,
            num_turns,
            session_id,
        } => Some(FinalResult {
            subtype,
            result,
            total_cost_usd,
            duration_ms,
            num_turns,
            session_id,
        }),
        StreamEvent::Unknown => None,
    }
}

/// Capture stderr verbatim: retained for failure messages and surfaced
/// line-by-line as `diagnostic` notifications.
fn spawn_stderr_capture(
    stderr: ChildStderr,
    buf: Arc<Mutex<String>>,
    notifications: mpsc::Sender<AgentNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            {
                let mut guard = buf.lock().await;
                if !guard.is_empty() {
                    guard.push('\n');
                }
                guard.push_str(&line);
            }
            let _ = notifications
                .send(AgentNotification::Diagnostic { line })
                .await;
        }
    })
}

/// Wait for the stderr task to drain, then return the captured text.
async fn drain_stderr(task: Option<JoinHandle<()>>, buf: &Arc<Mutex<String>>) -> String {
    if let Some(handle) = task {
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
    buf.lock().await.clone()
}

/// Wait up to `grace` for a natural exit, then escalate to termination.
async fn wait_or_terminate(child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!(%err, "error waiting for agent process");
            None
        }
        Err(_) => {
            warn!("agent process lingered after its stream settled, terminating");
            terminate(child, KILL_GRACE).await;
            None
        }
    }
}

/// `SIGTERM`, then `SIGKILL` once the grace window elapses.
async fn terminate(child: &mut Child, grace: Duration) {
    send_sigterm(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(?status, "agent process exited after SIGTERM"),
        Ok(Err(err)) => warn!(%err, "error waiting for agent process after SIGTERM"),
        Err(_) => {
            warn!("agent process survived the SIGTERM grace window, escalating to SIGKILL");
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill agent process");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Ok(raw) = i32::try_from(pid) {
            if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                warn!(%err, pid, "failed to deliver SIGTERM to agent process");
            }
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

fn describe_exit(status: Option<std::process::ExitStatus>) -> String {
    status.map_or_else(
        || "exit status unknown".to_owned(),
        |s| {
            s.code().map_or_else(
                || "terminated by signal".to_owned(),
                |code| format!("exit code {code}"),
            )
        },
    )
}

fn stderr_suffix(stderr_text: &str) -> String {
    if stderr_text.is_empty() {
        String::new()
    } else {
        format!("; stderr: {stderr_text}")
    }
}
