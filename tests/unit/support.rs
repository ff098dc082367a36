//! Shared fixtures: a shell-script stand-in for the agent CLI.

use std::fs;

use agent_foreman::config::AgentConfig;
use tempfile::TempDir;

/// JSON line for a successful `result` event.
pub const RESULT_SUCCESS: &str =
    r#"{"type":"result","subtype":"success","result":"all done","total_cost_usd":0.25,"duration_ms":1200,"num_turns":3,"session_id":"sess-1"}"#;

/// Write an executable shell script standing in for the agent CLI and
/// return an [`AgentConfig`] pointing at it. The returned `TempDir`
/// must stay alive for the duration of the test.
pub fn fake_agent(script_body: &str) -> (TempDir, AgentConfig) {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("fake-agent.sh");
    fs::write(&path, format!("#!/bin/sh\n{script_body}\n")).expect("write fake agent script");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake agent");
    }

    let config = AgentConfig {
        executable: path.display().to_string(),
        ..AgentConfig::default()
    };
    (dir, config)
}

/// Script body that emits a short happy-path stream and exits 0.
#[must_use]
pub fn success_script() -> String {
    format!(
        "printf '%s\\n' '{init}'\n\
         printf '%s\\n' '{assistant}'\n\
         printf '%s\\n' '{result}'",
        init = r#"{"type":"system","subtype":"init","session_id":"sess-1"}"#,
        assistant = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}],"model":"test-model"}}"#,
        result = RESULT_SUCCESS,
    )
}
