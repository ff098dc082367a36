//! Unit tests for session status transitions, single-in-flight
//! enforcement, cancellation, and event forwarding.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use agent_foreman::agent::client::AgentClient;
use agent_foreman::config::AgentConfig;
use agent_foreman::session::{SessionEvent, SessionManager, SessionStatus};
use agent_foreman::AppError;

use super::support::{fake_agent, success_script, RESULT_SUCCESS};

fn manager_for(config: AgentConfig) -> Arc<SessionManager> {
    let defaults = config.prompt_options();
    Arc::new(SessionManager::new(
        Arc::new(AgentClient::new(config)),
        defaults,
    ))
}

#[tokio::test]
async fn send_and_wait_drives_idle_to_completed() {
    let (_dir, config) = fake_agent(&success_script());
    let manager = manager_for(config);
    let session = manager.create_session(None).unwrap();

    assert_eq!(session.status(), SessionStatus::Idle);
    let result = session.send_and_wait("do it", None).await.unwrap();
    assert_eq!(result, "all done");
    assert_eq!(session.status(), SessionStatus::Completed);
}

#[tokio::test]
async fn second_send_while_working_is_rejected() {
    let script = format!("sleep 1\nprintf '%s\\n' '{RESULT_SUCCESS}'");
    let (_dir, config) = fake_agent(&script);
    let manager = manager_for(config);
    let session = manager.create_session(None).unwrap();

    let first = session.send("one").unwrap();
    assert!(!first.is_empty(), "send returns a message id immediately");
    assert_eq!(session.status(), SessionStatus::Working);

    let err = session.send("two").unwrap_err();
    assert!(
        matches!(&err, AppError::Session(m) if m.contains("already working")),
        "got {err:?}"
    );
}

#[tokio::test]
async fn failed_run_moves_the_session_to_failed() {
    let script = concat!(
        "printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"error_during_execution\",\"result\":\"broke\"}'\n",
        "exit 1",
    );
    let (_dir, config) = fake_agent(script);
    let manager = manager_for(config);
    let session = manager.create_session(None).unwrap();

    let err = session.send_and_wait("p", None).await.unwrap_err();
    assert!(matches!(err, AppError::Agent(_)));
    assert_eq!(session.status(), SessionStatus::Failed);

    // Terminal status: no further sends.
    assert!(session.send("again").is_err());
}

#[tokio::test]
async fn send_after_destroy_is_rejected_with_completed_status() {
    let (_dir, config) = fake_agent(&success_script());
    let manager = manager_for(config);
    let session = manager.create_session(None).unwrap();

    session.destroy();
    assert_eq!(session.status(), SessionStatus::Completed);

    let err = session.send("p").unwrap_err();
    assert!(
        matches!(&err, AppError::Session(m) if m.contains("completed")),
        "got {err:?}"
    );

    // destroy is idempotent.
    session.destroy();
    assert_eq!(session.status(), SessionStatus::Completed);
}

#[tokio::test]
async fn cancel_returns_to_idle_and_drops_the_stale_result() {
    let script = format!("sleep 0.4\nprintf '%s\\n' '{RESULT_SUCCESS}'");
    let (_dir, config) = fake_agent(&script);
    let manager = manager_for(config);
    let session = manager.create_session(None).unwrap();

    let mut events = session.subscribe();
    session.send("p").unwrap();
    session.cancel();
    assert_eq!(session.status(), SessionStatus::Idle);

    // Give the underlying invocation time to settle; the stale result
    // must be swallowed, not delivered as success.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(session.status(), SessionStatus::Idle);

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::Completed { .. } | SessionEvent::Failed { .. }),
            "no settlement may be delivered after cancel"
        );
    }

    // The session is reusable after cancel.
    let result = session.send_and_wait("again", None).await.unwrap();
    assert_eq!(result, "all done");
}

#[tokio::test]
async fn caller_side_timeout_stops_waiting_without_settling() {
    let (_dir, mut config) = fake_agent("sleep 20");
    config.inactivity_timeout_ms = 60_000;
    let manager = manager_for(config);
    let session = manager.create_session(None).unwrap();

    let err = session
        .send_and_wait("p", Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");

    // The invocation is still in flight; the caller only stopped waiting.
    assert_eq!(session.status(), SessionStatus::Working);
    session.destroy();
}

#[tokio::test]
async fn client_events_are_forwarded_in_stream_order() {
    let script = concat!(
        "printf '%s\\n' '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"thinking\"}]}}'\n",
        "printf '%s\\n' '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"name\":\"Edit\",\"input\":{\"path\":\"a.rs\"}}]}}'\n",
        "printf '%s\\n' '{\"type\":\"user\",\"message\":{\"content\":[{\"type\":\"tool_result\",\"content\":\"edited\",\"is_error\":false}]}}'\n",
        "echo 'minor grumble' >&2\n",
        "printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"ok\"}'",
    );
    let (_dir, config) = fake_agent(script);
    let manager = manager_for(config);
    let session = manager.create_session(None).unwrap();

    let mut events = session.subscribe();
    session.send("p").unwrap();

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        let done = matches!(event, SessionEvent::Completed { .. });
        seen.push(event);
        if done {
            break;
        }
    }

    let text = seen
        .iter()
        .position(|e| matches!(e, SessionEvent::Text { content, .. } if content == "thinking"));
    let tool_call = seen
        .iter()
        .position(|e| matches!(e, SessionEvent::ToolCall { name, .. } if name == "Edit"));
    let tool_result = seen
        .iter()
        .position(|e| matches!(e, SessionEvent::ToolResult { content, .. } if content == "edited"));
    let diagnostic = seen
        .iter()
        .position(|e| matches!(e, SessionEvent::Diagnostic { line, .. } if line.contains("grumble")));

    assert!(text.is_some() && tool_call.is_some() && tool_result.is_some());
    assert!(text < tool_call && tool_call < tool_result, "stdout order preserved");
    assert!(diagnostic.is_some(), "stderr forwarded as diagnostic");
}

#[tokio::test]
async fn settlement_event_carries_the_message_id_from_send() {
    let (_dir, config) = fake_agent(&success_script());
    let manager = manager_for(config);
    let session = manager.create_session(None).unwrap();

    let mut events = session.subscribe();
    let message_id = session.send("p").unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        if let SessionEvent::Completed {
            message_id: settled,
            result_text,
        } = event
        {
            assert_eq!(settled, message_id);
            assert_eq!(result_text, "all done");
            break;
        }
    }
}
