//! Unit tests for the process-driving client, backed by a shell-script
//! stand-in for the agent CLI.

#![cfg(unix)]

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use agent_foreman::agent::client::AgentClient;
use agent_foreman::agent::events::{AgentNotification, WarningKind};
use agent_foreman::agent::args::PromptOptions;
use agent_foreman::AppError;

use super::support::{fake_agent, success_script};

fn drain(rx: &mut mpsc::Receiver<AgentNotification>) -> Vec<AgentNotification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

#[tokio::test]
async fn successful_run_resolves_with_result_metadata() {
    let (_dir, config) = fake_agent(&success_script());
    let client = AgentClient::new(config);
    let (tx, mut rx) = mpsc::channel(64);

    let outcome = client
        .execute_prompt("do the thing", &PromptOptions::default(), tx)
        .await
        .unwrap();

    assert_eq!(outcome.result_text, "all done");
    assert_eq!(outcome.cost_usd, Some(0.25));
    assert_eq!(outcome.duration_ms, Some(1200));
    assert_eq!(outcome.num_turns, Some(3));
    assert_eq!(outcome.agent_session_id.as_deref(), Some("sess-1"));

    let notifications = drain(&mut rx);
    assert!(
        notifications
            .iter()
            .any(|n| matches!(n, AgentNotification::Text { content } if content == "working on it")),
        "text blocks must stream out incrementally"
    );
}

#[tokio::test]
async fn tool_use_and_tool_result_blocks_become_notifications() {
    let script = concat!(
        "printf '%s\\n' '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"name\":\"Bash\",\"input\":{\"command\":\"ls\"}}]}}'\n",
        "printf '%s\\n' '{\"type\":\"user\",\"message\":{\"content\":[{\"type\":\"tool_result\",\"content\":\"file.txt\",\"is_error\":false}]}}'\n",
        "printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"ok\"}'",
    );
    let (_dir, config) = fake_agent(script);
    let client = AgentClient::new(config);
    let (tx, mut rx) = mpsc::channel(64);

    client
        .execute_prompt("p", &PromptOptions::default(), tx)
        .await
        .unwrap();

    let notifications = drain(&mut rx);
    let tool_call = notifications
        .iter()
        .position(|n| matches!(n, AgentNotification::ToolCall { name, .. } if name == "Bash"));
    let tool_result = notifications
        .iter()
        .position(|n| matches!(n, AgentNotification::ToolResult { content, is_error: false } if content == "file.txt"));
    assert!(tool_call.is_some(), "missing tool_call notification");
    assert!(tool_result.is_some(), "missing tool_result notification");
    assert!(tool_call < tool_result, "stream order must be preserved");
}

#[tokio::test]
async fn malformed_lines_warn_and_never_abort_the_run() {
    let script = concat!(
        "printf '%s\\n' 'plainly not json'\n",
        "printf '%s\\n' '{\"type\":\"comet\",\"x\":1}'\n",
        "printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"survived\"}'",
    );
    let (_dir, config) = fake_agent(script);
    let client = AgentClient::new(config);
    let (tx, mut rx) = mpsc::channel(64);

    let outcome = client
        .execute_prompt("p", &PromptOptions::default(), tx)
        .await
        .unwrap();
    assert_eq!(outcome.result_text, "survived");

    let warnings = drain(&mut rx)
        .into_iter()
        .filter(|n| {
            matches!(
                n,
                AgentNotification::Warning {
                    kind: WarningKind::MalformedJson,
                    ..
                }
            )
        })
        .count();
    assert_eq!(warnings, 2, "each dropped line warns once");
}

#[tokio::test]
async fn error_result_subtype_rejects_with_the_result_text() {
    let script = concat!(
        "printf '%s\\n' '{\"type\":\"result\",\"subtype\":\"error_during_execution\",\"result\":\"could not apply patch\"}'\n",
        "exit 1",
    );
    let (_dir, config) = fake_agent(script);
    let client = AgentClient::new(config);
    let (tx, _rx) = mpsc::channel(64);

    let err = client
        .execute_prompt("p", &PromptOptions::default(), tx)
        .await
        .unwrap_err();
    match err {
        AppError::Agent(message) => {
            assert!(message.contains("could not apply patch"), "got: {message}");
            assert!(message.contains("exit code 1"), "got: {message}");
        }
        other => panic!("expected agent error, got {other:?}"),
    }
}

#[tokio::test]
async fn nonzero_exit_without_result_surfaces_stderr() {
    let script = concat!(
        "echo 'fatal: credential helper exploded' >&2\n",
        "exit 7",
    );
    let (_dir, config) = fake_agent(script);
    let client = AgentClient::new(config);
    let (tx, mut rx) = mpsc::channel(64);

    let err = client
        .execute_prompt("p", &PromptOptions::default(), tx)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("without a result event"), "got: {message}");
    assert!(
        message.contains("credential helper exploded"),
        "stderr must be preserved verbatim: {message}"
    );

    assert!(
        drain(&mut rx).iter().any(|n| matches!(
            n,
            AgentNotification::Diagnostic { line } if line.contains("credential helper")
        )),
        "stderr must also stream as diagnostics"
    );
}

#[tokio::test]
async fn missing_executable_rejects_with_spawn_error() {
    let config = agent_foreman::config::AgentConfig {
        executable: "/definitely/not/a/real/agent-binary".into(),
        ..agent_foreman::config::AgentConfig::default()
    };
    let client = AgentClient::new(config);
    let (tx, _rx) = mpsc::channel(8);

    let err = client
        .execute_prompt("p", &PromptOptions::default(), tx)
        .await
        .unwrap_err();
    assert!(matches!(&err, AppError::Agent(m) if m.contains("failed to spawn")));
}

#[tokio::test]
async fn silent_agent_is_killed_by_the_inactivity_watchdog() {
    let (_dir, mut config) = fake_agent("sleep 30");
    config.inactivity_timeout_ms = 300;
    config.request_timeout_ms = 60_000;
    let client = AgentClient::new(config);
    let (tx, _rx) = mpsc::channel(8);

    let started = Instant::now();
    let err = client
        .execute_prompt("p", &PromptOptions::default(), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Stalled(_)), "got {err:?}");
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "watchdog must not wait for the 30s sleep"
    );
}

#[tokio::test]
async fn deadline_fires_even_while_events_keep_arriving() {
    // The agent drips events faster than the watchdog, so only the
    // overall deadline can stop it — activity resets must never extend
    // a run past the hard ceiling.
    let script = concat!(
        "i=0\n",
        "while [ $i -lt 60 ]; do\n",
        "  printf '%s\\n' '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"tick\"}]}}'\n",
        "  sleep 0.1\n",
        "  i=$((i+1))\n",
        "done",
    );
    let (_dir, mut config) = fake_agent(script);
    config.inactivity_timeout_ms = 2_000;
    config.request_timeout_ms = 700;
    let client = AgentClient::new(config);
    let (tx, _rx) = mpsc::channel(1024);

    let started = Instant::now();
    let err = client
        .execute_prompt("p", &PromptOptions::default(), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");
    assert!(
        started.elapsed() < Duration::from_secs(6),
        "deadline must fire near 700ms, not after the drip ends"
    );
}

#[tokio::test]
async fn per_call_timeout_overrides_the_configured_default() {
    let (_dir, mut config) = fake_agent("sleep 30");
    config.inactivity_timeout_ms = 60_000;
    let client = AgentClient::new(config);
    let (tx, _rx) = mpsc::channel(8);

    let options = PromptOptions {
        inactivity_timeout: Some(Duration::from_millis(250)),
        ..PromptOptions::default()
    };

    let started = Instant::now();
    let err = client.execute_prompt("p", &options, tx).await.unwrap_err();
    assert!(matches!(err, AppError::Stalled(_)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn stream_end_without_result_is_an_abnormal_termination() {
    let script = "printf '%s\\n' '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hi\"}]}}'";
    let (_dir, config) = fake_agent(script);
    let client = AgentClient::new(config);
    let (tx, _rx) = mpsc::channel(8);

    let err = client
        .execute_prompt("p", &PromptOptions::default(), tx)
        .await
        .unwrap_err();
    assert!(matches!(&err, AppError::Agent(m) if m.contains("without a result event")));
}
