//! Drives an execution plan phase by phase.
//!
//! Sequential phases run items one at a time; parallel phases start
//! every item and barrier on full settlement, so phase *N+1* never
//! starts before every item in phase *N* has settled. Item failures are
//! recorded and reported as blockers without aborting siblings; a phase
//! with zero successes halts the run unless overridden. Tracking-service
//! calls are wrapped in the retry engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::plan::phases::{build_phases, dependency_warnings, Phase};
use crate::retry::{with_retry, RetryPolicy};
use crate::session::SessionManager;
use crate::tracker::{SessionNotes, TrackerClient, WorkItem, WorkItemKind, WorkItemStatus};
use crate::Result;

/// Longest result-text excerpt forwarded as a completion summary.
const SUMMARY_LIMIT: usize = 300;

/// Knobs for one plan run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Halt the run when a phase finishes with zero successful items.
    pub halt_on_failed_phase: bool,
    /// Caller-side ceiling for one item's agent run.
    pub item_timeout: Option<Duration>,
    /// Retry policy for tracking-service writes.
    pub write_retry: RetryPolicy,
    /// Retry policy for tracking-service reads.
    pub read_retry: RetryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            halt_on_failed_phase: true,
            item_timeout: None,
            write_retry: RetryPolicy::standard(),
            read_retry: RetryPolicy::read_heavy(),
        }
    }
}

/// How one item's run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemDisposition {
    /// The agent run settled successfully.
    Succeeded,
    /// The run failed; the blocker was reported to the service.
    Failed {
        /// Failure description.
        error: String,
    },
    /// Never attempted because the run halted earlier.
    Skipped,
}

/// Per-item record in the final report.
#[derive(Debug, Clone)]
pub struct ItemReport {
    /// Item identifier.
    pub item_id: String,
    /// Feature or task.
    pub kind: WorkItemKind,
    /// Item title.
    pub title: String,
    /// How the run ended.
    pub disposition: ItemDisposition,
}

impl ItemReport {
    /// Whether the item's agent run succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.disposition == ItemDisposition::Succeeded
    }

    fn skipped(item: &WorkItem) -> Self {
        Self {
            item_id: item.id.clone(),
            kind: item.kind,
            title: item.title.clone(),
            disposition: ItemDisposition::Skipped,
        }
    }
}

/// Final report for one plan run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Epic the plan belonged to.
    pub epic_id: String,
    /// Phases the plan produced.
    pub phases_planned: usize,
    /// Phases actually executed.
    pub phases_run: usize,
    /// Per-item outcomes, in phase order.
    pub items: Vec<ItemReport>,
    /// Whether the run halted on a fully-failed phase.
    pub halted: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Count of items whose agent run succeeded.
    #[must_use]
    pub fn succeeded_count(&self) -> usize {
        self.items.iter().filter(|item| item.succeeded()).count()
    }

    /// Count of items that failed.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item.disposition, ItemDisposition::Failed { .. }))
            .count()
    }
}

/// Scheduler that turns an epic's work-item list into phased agent runs.
#[derive(Clone)]
pub struct PlanRunner {
    tracker: Arc<dyn TrackerClient>,
    sessions: Arc<SessionManager>,
    options: RunOptions,
}

impl PlanRunner {
    /// Build a runner over a tracking-service client and session manager.
    #[must_use]
    pub fn new(
        tracker: Arc<dyn TrackerClient>,
        sessions: Arc<SessionManager>,
        options: RunOptions,
    ) -> Self {
        Self {
            tracker,
            sessions,
            options,
        }
    }

    /// Run the epic's full execution plan.
    ///
    /// # Errors
    ///
    /// Returns an error only when the run cannot start at all (session
    /// or plan fetch failure after retries). Item failures are recorded
    /// in the report, not raised.
    pub async fn run(&self, epic_id: &str) -> Result<RunReport> {
        self.run_inner(epic_id)
            .instrument(info_span!("plan_run", epic_id))
            .await
    }

    async fn run_inner(&self, epic_id: &str) -> Result<RunReport> {
        let started_at = Utc::now();
        let tracker_session = with_retry(
            || self.tracker.start_session(epic_id),
            &self.options.write_retry,
        )
        .await?;
        info!(tracker_session = %tracker_session, "tracker work session opened");

        let plan = with_retry(
            || self.tracker.get_execution_plan(epic_id),
            &self.options.read_retry,
        )
        .await?;

        for warning in dependency_warnings(&plan.items) {
            warn!(%warning, "dependency order check");
        }

        let phases = build_phases(&plan.items);
        info!(
            phases = phases.len(),
            items = plan.total_items,
            "execution plan scheduled"
        );

        let mut items: Vec<ItemReport> = Vec::new();
        let mut halted = false;
        let mut phases_run = 0;

        for (position, phase) in phases.iter().enumerate() {
            if halted {
                items.extend(phase.items.iter().map(ItemReport::skipped));
                continue;
            }

            info!(
                phase = position + 1,
                execution_order = phase.execution_order,
                parallel = phase.can_run_in_parallel,
                items = phase.items.len(),
                "phase starting"
            );

            let phase_reports = if phase.can_run_in_parallel {
                self.run_parallel_phase(phase).await
            } else {
                self.run_sequential_phase(phase).await
            };
            phases_run += 1;

            let any_success = phase_reports.iter().any(ItemReport::succeeded);
            items.extend(phase_reports);

            self.log_progress(epic_id).await;

            if !any_success && self.options.halt_on_failed_phase {
                error!(
                    phase = position + 1,
                    "phase finished with no successful items, halting run"
                );
                halted = true;
            }
        }

        self.reconcile(epic_id, &items).await;

        let report = RunReport {
            epic_id: epic_id.to_owned(),
            phases_planned: phases.len(),
            phases_run,
            items,
            halted,
            started_at,
            finished_at: Utc::now(),
        };

        let notes = build_session_notes(&report);
        if let Err(err) = with_retry(
            || self.tracker.end_session(epic_id, notes.clone()),
            &self.options.write_retry,
        )
        .await
        {
            warn!(%err, "failed to record end-of-session notes");
        }

        Ok(report)
    }

    async fn run_sequential_phase(&self, phase: &Phase) -> Vec<ItemReport> {
        let mut reports = Vec::with_capacity(phase.items.len());
        for item in &phase.items {
            reports.push(self.run_item(item.clone()).await);
        }
        reports
    }

    /// Start every item, then barrier until all have settled.
    async fn run_parallel_phase(&self, phase: &Phase) -> Vec<ItemReport> {
        let positions: HashMap<String, usize> = phase
            .items
            .iter()
            .enumerate()
            .map(|(index, item)| (item.id.clone(), index))
            .collect();

        let mut workers = JoinSet::new();
        for item in &phase.items {
            let runner = self.clone();
            let item = item.clone();
            workers.spawn(async move { runner.run_item(item).await });
        }

        let mut reports = Vec::with_capacity(phase.items.len());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!(%err, "phase worker panicked"),
            }
        }

        // Report in declared order regardless of completion order.
        reports.sort_by_key(|report| positions.get(&report.item_id).copied().unwrap_or(usize::MAX));
        reports
    }

    /// One item's full cycle: mark started, drive an agent session to
    /// settlement, then mark completed or report the blocker.
    async fn run_item(&self, item: WorkItem) -> ItemReport {
        info!(item_id = %item.id, title = %item.title, "work item starting");

        if let Err(err) = with_retry(
            || self.tracker.start_work(item.kind, &item.id),
            &self.options.write_retry,
        )
        .await
        {
            warn!(%err, item_id = %item.id, "failed to mark item started");
            return self.fail_item(&item, &err.to_string()).await;
        }

        let session = match self.sessions.create_session(None) {
            Ok(session) => session,
            Err(err) => return self.fail_item(&item, &err.to_string()).await,
        };

        let prompt = item_prompt(&item);
        let outcome = session
            .send_and_wait(&prompt, self.options.item_timeout)
            .await;
        self.sessions.destroy_session(session.id());

        match outcome {
            Ok(result_text) => {
                let summary = summarize(&result_text);
                if let Err(err) = with_retry(
                    || {
                        self.tracker
                            .complete_work(item.kind, &item.id, Some(summary.clone()))
                    },
                    &self.options.write_retry,
                )
                .await
                {
                    // The run still succeeded; the reconciliation sweep
                    // will re-mark the item.
                    warn!(
                        %err,
                        item_id = %item.id,
                        "item finished but the completion update failed"
                    );
                }
                info!(item_id = %item.id, "work item completed");
                ItemReport {
                    item_id: item.id,
                    kind: item.kind,
                    title: item.title,
                    disposition: ItemDisposition::Succeeded,
                }
            }
            Err(err) => {
                error!(%err, item_id = %item.id, "work item failed");
                self.fail_item(&item, &err.to_string()).await
            }
        }
    }

    async fn fail_item(&self, item: &WorkItem, reason: &str) -> ItemReport {
        if let Err(err) = with_retry(
            || self.tracker.report_blocker(item.kind, &item.id, reason),
            &self.options.write_retry,
        )
        .await
        {
            warn!(%err, item_id = %item.id, "failed to report blocker");
        }
        ItemReport {
            item_id: item.id.clone(),
            kind: item.kind,
            title: item.title.clone(),
            disposition: ItemDisposition::Failed {
                error: reason.to_owned(),
            },
        }
    }

    async fn log_progress(&self, epic_id: &str) {
        match with_retry(
            || self.tracker.get_progress_summary(epic_id),
            &self.options.read_retry,
        )
        .await
        {
            Ok(progress) => info!(
                completed = progress.completed,
                total = progress.total_items,
                percent = progress.percent_complete,
                "epic progress"
            ),
            Err(err) => debug!(%err, "progress summary unavailable"),
        }
    }

    /// Sweep the service's current statuses and re-mark items that
    /// succeeded locally but are not recorded complete. Unattempted
    /// items are never touched.
    async fn reconcile(&self, epic_id: &str, reports: &[ItemReport]) {
        let succeeded: Vec<&ItemReport> = reports.iter().filter(|r| r.succeeded()).collect();
        if succeeded.is_empty() {
            return;
        }

        let plan = match with_retry(
            || self.tracker.get_execution_plan(epic_id),
            &self.options.read_retry,
        )
        .await
        {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%err, "reconciliation sweep skipped: execution plan unavailable");
                return;
            }
        };

        let statuses: HashMap<&str, WorkItemStatus> = plan
            .items
            .iter()
            .map(|item| (item.id.as_str(), item.status))
            .collect();

        for report in succeeded {
            if statuses.get(report.item_id.as_str()).copied() == Some(WorkItemStatus::Completed) {
                continue;
            }
            info!(item_id = %report.item_id, "re-marking completed item missed by the service");
            if let Err(err) = with_retry(
                || self.tracker.complete_work(report.kind, &report.item_id, None),
                &self.options.write_retry,
            )
            .await
            {
                warn!(%err, item_id = %report.item_id, "reconciliation update failed");
            }
        }
    }
}

/// Build the agent prompt for one work item.
fn item_prompt(item: &WorkItem) -> String {
    match item.description.as_deref() {
        Some(description) if !description.is_empty() => {
            format!("{}\n\n{description}", item.title)
        }
        _ => item.title.clone(),
    }
}

/// First line of the result text, bounded for the completion summary.
fn summarize(result_text: &str) -> String {
    let first_line = result_text.lines().next().unwrap_or_default().trim();
    if first_line.len() <= SUMMARY_LIMIT {
        return first_line.to_owned();
    }
    let mut end = SUMMARY_LIMIT;
    while !first_line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &first_line[..end])
}

fn build_session_notes(report: &RunReport) -> SessionNotes {
    let mut next_steps = Vec::new();
    let mut blockers = Vec::new();

    for item in &report.items {
        match &item.disposition {
            ItemDisposition::Failed { error } => {
                next_steps.push(format!("Retry {}", item.title));
                blockers.push(format!("{}: {error}", item.title));
            }
            ItemDisposition::Skipped => {
                next_steps.push(format!("Schedule {}", item.title));
            }
            ItemDisposition::Succeeded => {}
        }
    }

    let mut decisions = Vec::new();
    if report.halted {
        decisions.push("Halted the run after a phase finished with no successful items".to_owned());
    }

    SessionNotes {
        summary: format!(
            "Completed {} of {} items across {} of {} phases",
            report.succeeded_count(),
            report.items.len(),
            report.phases_run,
            report.phases_planned
        ),
        next_steps,
        blockers,
        decisions,
    }
}
