//! Unit tests for the execution-plan runner: phase ordering, the
//! settlement barrier, failure isolation, halting, and the
//! reconciliation sweep. Uses an in-memory tracking service and a
//! shell-script agent.

#![cfg(unix)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use agent_foreman::agent::client::AgentClient;
use agent_foreman::plan::{ItemDisposition, PlanRunner, RunOptions};
use agent_foreman::session::SessionManager;
use agent_foreman::tracker::{
    ExecutionPlan, NewItem, ProgressSummary, SessionNotes, Team, TrackerClient, TrackerFuture,
    WorkItem, WorkItemKind, WorkItemStatus,
};
use agent_foreman::AppError;

use super::support::fake_agent;

// ── In-memory tracking service ────────────────────────────────────────────────

struct MockState {
    log: Vec<String>,
    statuses: HashMap<String, WorkItemStatus>,
    fail_complete_once: HashSet<String>,
}

struct MockTracker {
    items: Vec<WorkItem>,
    state: Mutex<MockState>,
}

impl MockTracker {
    fn new(items: Vec<WorkItem>) -> Arc<Self> {
        Arc::new(Self {
            items,
            state: Mutex::new(MockState {
                log: Vec::new(),
                statuses: HashMap::new(),
                fail_complete_once: HashSet::new(),
            }),
        })
    }

    fn failing_complete_once(self: Arc<Self>, id: &str) -> Arc<Self> {
        self.state
            .lock()
            .unwrap()
            .fail_complete_once
            .insert(id.to_owned());
        self
    }

    fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    fn status_of(&self, id: &str) -> WorkItemStatus {
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(id)
            .copied()
            .unwrap_or_default()
    }
}

impl TrackerClient for MockTracker {
    fn create_epic(&self, _item: NewItem) -> TrackerFuture<'_, String> {
        Box::pin(async { Ok("epic-1".to_owned()) })
    }

    fn create_feature(&self, _epic_id: &str, _item: NewItem) -> TrackerFuture<'_, String> {
        Box::pin(async { Ok("feat-1".to_owned()) })
    }

    fn create_task(&self, _feature_id: &str, _item: NewItem) -> TrackerFuture<'_, String> {
        Box::pin(async { Ok("task-1".to_owned()) })
    }

    fn get_execution_plan(&self, _epic_id: &str) -> TrackerFuture<'_, ExecutionPlan> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let items: Vec<WorkItem> = self
                .items
                .iter()
                .cloned()
                .map(|mut item| {
                    if let Some(status) = state.statuses.get(&item.id) {
                        item.status = *status;
                    }
                    item
                })
                .collect();
            Ok(ExecutionPlan {
                total_items: items.len(),
                items,
            })
        })
    }

    fn start_work(&self, _kind: WorkItemKind, id: &str) -> TrackerFuture<'_, ()> {
        let id = id.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("start:{id}"));
            state.statuses.insert(id, WorkItemStatus::InProgress);
            Ok(())
        })
    }

    fn complete_work(
        &self,
        _kind: WorkItemKind,
        id: &str,
        _summary: Option<String>,
    ) -> TrackerFuture<'_, ()> {
        let id = id.to_owned();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.fail_complete_once.remove(&id) {
                state.log.push(format!("complete_err:{id}"));
                return Err(AppError::Tracker {
                    status: 422,
                    message: "synthetic completion failure".into(),
                });
            }
            state.log.push(format!("complete:{id}"));
            state.statuses.insert(id, WorkItemStatus::Completed);
            Ok(())
        })
    }

    fn report_blocker(&self, _kind: WorkItemKind, id: &str, reason: &str) -> TrackerFuture<'_, ()> {
        let id = id.to_owned();
        let _ = reason;
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.log.push(format!("blocker:{id}"));
            state.statuses.insert(id, WorkItemStatus::Blocked);
            Ok(())
        })
    }

    fn get_progress_summary(&self, _epic_id: &str) -> TrackerFuture<'_, ProgressSummary> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let total = u32::try_from(self.items.len()).unwrap();
            let completed = u32::try_from(
                self.items
                    .iter()
                    .filter(|item| {
                        state.statuses.get(&item.id) == Some(&WorkItemStatus::Completed)
                    })
                    .count(),
            )
            .unwrap();
            let percent = f64::from(completed) / f64::from(total) * 100.0;
            state.log.push(format!("progress:{percent:.0}"));
            Ok(ProgressSummary {
                total_items: total,
                completed,
                in_progress: 0,
                blocked: 0,
                percent_complete: percent,
            })
        })
    }

    fn start_session(&self, _epic_id: &str) -> TrackerFuture<'_, String> {
        Box::pin(async move {
            self.state.lock().unwrap().log.push("session_start".into());
            Ok("ts-1".to_owned())
        })
    }

    fn end_session(&self, _epic_id: &str, _notes: SessionNotes) -> TrackerFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().unwrap().log.push("session_end".into());
            Ok(())
        })
    }

    fn list_teams(&self) -> TrackerFuture<'_, Vec<Team>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn work_item(id: &str, title: &str, order: u32, group: Option<&str>) -> WorkItem {
    WorkItem {
        id: id.to_owned(),
        kind: WorkItemKind::Task,
        title: title.to_owned(),
        description: None,
        execution_order: order,
        can_parallelize: group.is_some(),
        parallel_group: group.map(str::to_owned),
        dependencies: Vec::new(),
        status: WorkItemStatus::NotStarted,
    }
}

/// The canonical four-item plan: A, then B‖C, then D.
fn four_item_plan(failing_title: Option<&str>) -> Vec<WorkItem> {
    let title = |name: &str| {
        if failing_title == Some(name) {
            format!("boom {name}")
        } else {
            format!("implement {name}")
        }
    };
    vec![
        work_item("A", &title("A"), 1, None),
        work_item("B", &title("B"), 2, Some("x")),
        work_item("C", &title("C"), 2, Some("x")),
        work_item("D", &title("D"), 3, None),
    ]
}

/// Agent script: fails (error result + exit 2) when the prompt contains
/// "boom", succeeds otherwise.
const BRANCHING_AGENT: &str = r#"case "$2" in
  *boom*)
    printf '%s\n' '{"type":"result","subtype":"error_during_execution","result":"task failed"}'
    exit 2
    ;;
esac
sleep 0.1
printf '%s\n' '{"type":"result","subtype":"success","result":"implemented"}'"#;

fn runner_over(tracker: &Arc<MockTracker>, options: RunOptions) -> (PlanRunner, tempfile::TempDir) {
    let (dir, config) = fake_agent(BRANCHING_AGENT);
    let defaults = config.prompt_options();
    let sessions = Arc::new(SessionManager::new(
        Arc::new(AgentClient::new(config)),
        defaults,
    ));
    let tracker: Arc<dyn TrackerClient> = Arc::clone(tracker) as Arc<dyn TrackerClient>;
    (PlanRunner::new(tracker, sessions, options), dir)
}

fn index_of(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|line| line == entry)
        .unwrap_or_else(|| panic!("`{entry}` missing from log {log:?}"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_run_completes_every_item_with_barriers_between_phases() {
    let tracker = MockTracker::new(four_item_plan(None));
    let (runner, _dir) = runner_over(&tracker, RunOptions::default());

    let report = runner.run("epic-1").await.unwrap();

    assert_eq!(report.phases_planned, 3);
    assert_eq!(report.phases_run, 3);
    assert_eq!(report.succeeded_count(), 4);
    assert!(!report.halted);

    let log = tracker.log();

    // Phase 1 settles before phase 2 starts.
    let complete_a = index_of(&log, "complete:A");
    assert!(complete_a < index_of(&log, "start:B"));
    assert!(complete_a < index_of(&log, "start:C"));

    // Phase 2 fully settles before phase 3 starts (the barrier).
    let start_d = index_of(&log, "start:D");
    assert!(index_of(&log, "complete:B") < start_d);
    assert!(index_of(&log, "complete:C") < start_d);

    // A session wraps the whole run.
    assert_eq!(log.first().map(String::as_str), Some("session_start"));
    assert_eq!(log.last().map(String::as_str), Some("session_end"));

    // Progress after each phase: 25% → 75% → 100%.
    let progress: Vec<&str> = log
        .iter()
        .filter(|line| line.starts_with("progress:"))
        .map(String::as_str)
        .collect();
    assert_eq!(progress, ["progress:25", "progress:75", "progress:100"]);
}

#[tokio::test]
async fn parallel_sibling_failure_does_not_abort_the_phase_or_the_run() {
    let tracker = MockTracker::new(four_item_plan(Some("B")));
    let (runner, _dir) = runner_over(&tracker, RunOptions::default());

    let report = runner.run("epic-1").await.unwrap();

    assert!(!report.halted, "a partially-failed phase does not halt");
    assert_eq!(report.phases_run, 3);
    assert_eq!(report.succeeded_count(), 3);
    assert_eq!(report.failed_count(), 1);

    let by_id: HashMap<&str, &ItemDisposition> = report
        .items
        .iter()
        .map(|item| (item.item_id.as_str(), &item.disposition))
        .collect();
    assert!(matches!(by_id["B"], ItemDisposition::Failed { error } if error.contains("task failed")));
    assert_eq!(by_id["C"], &ItemDisposition::Succeeded);
    assert_eq!(by_id["D"], &ItemDisposition::Succeeded);

    let log = tracker.log();
    assert!(log.contains(&"blocker:B".to_owned()));
    assert_eq!(tracker.status_of("B"), WorkItemStatus::Blocked);
    // D still ran after the partially-failed phase settled.
    assert!(index_of(&log, "blocker:B") < index_of(&log, "start:D"));
}

#[tokio::test]
async fn phase_with_zero_successes_halts_and_skips_the_rest() {
    let tracker = MockTracker::new(four_item_plan(Some("A")));
    let (runner, _dir) = runner_over(&tracker, RunOptions::default());

    let report = runner.run("epic-1").await.unwrap();

    assert!(report.halted);
    assert_eq!(report.phases_run, 1);
    assert_eq!(report.succeeded_count(), 0);

    let by_id: HashMap<&str, &ItemDisposition> = report
        .items
        .iter()
        .map(|item| (item.item_id.as_str(), &item.disposition))
        .collect();
    assert!(matches!(by_id["A"], ItemDisposition::Failed { .. }));
    assert_eq!(by_id["B"], &ItemDisposition::Skipped);
    assert_eq!(by_id["C"], &ItemDisposition::Skipped);
    assert_eq!(by_id["D"], &ItemDisposition::Skipped);

    let log = tracker.log();
    assert!(!log.iter().any(|line| line == "start:B" || line == "start:C" || line == "start:D"));
    // The session is still closed out properly.
    assert!(log.contains(&"session_end".to_owned()));
}

#[tokio::test]
async fn halt_override_keeps_running_after_a_dead_phase() {
    let tracker = MockTracker::new(four_item_plan(Some("A")));
    let options = RunOptions {
        halt_on_failed_phase: false,
        ..RunOptions::default()
    };
    let (runner, _dir) = runner_over(&tracker, options);

    let report = runner.run("epic-1").await.unwrap();

    assert!(!report.halted);
    assert_eq!(report.phases_run, 3);
    assert_eq!(report.succeeded_count(), 3);
    assert_eq!(tracker.status_of("D"), WorkItemStatus::Completed);
}

#[tokio::test]
async fn reconciliation_re_marks_items_the_service_missed() {
    let tracker = MockTracker::new(four_item_plan(None)).failing_complete_once("A");
    let (runner, _dir) = runner_over(&tracker, RunOptions::default());

    let report = runner.run("epic-1").await.unwrap();

    // The agent run itself succeeded even though the first completion
    // update was rejected.
    assert_eq!(report.succeeded_count(), 4);

    let log = tracker.log();
    let first_attempt = index_of(&log, "complete_err:A");
    let resend = index_of(&log, "complete:A");
    assert!(first_attempt < resend, "reconciliation resends after the run");
    assert_eq!(tracker.status_of("A"), WorkItemStatus::Completed);
}

#[tokio::test]
async fn reconciliation_never_marks_unattempted_work_done() {
    let tracker = MockTracker::new(four_item_plan(Some("A")));
    let (runner, _dir) = runner_over(&tracker, RunOptions::default());

    runner.run("epic-1").await.unwrap();

    let log = tracker.log();
    for id in ["B", "C", "D"] {
        assert!(
            !log.iter().any(|line| line == &format!("complete:{id}")),
            "skipped item {id} must stay untouched"
        );
        assert_eq!(tracker.status_of(id), WorkItemStatus::NotStarted);
    }
}

#[tokio::test]
async fn every_item_runs_in_its_own_session_and_none_leak() {
    let tracker = MockTracker::new(four_item_plan(None));
    let (dir, config) = fake_agent(BRANCHING_AGENT);
    let defaults = config.prompt_options();
    let sessions = Arc::new(SessionManager::new(
        Arc::new(AgentClient::new(config)),
        defaults,
    ));
    let runner = PlanRunner::new(
        Arc::clone(&tracker) as Arc<dyn TrackerClient>,
        Arc::clone(&sessions),
        RunOptions::default(),
    );

    runner.run("epic-1").await.unwrap();
    drop(dir);

    assert_eq!(
        sessions.active_sessions(),
        0,
        "the runner must destroy each item's session after settlement"
    );
}
