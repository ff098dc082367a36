//! Tracking-service client boundary.
//!
//! The tracking service is the system of record for the epic → feature
//! → task hierarchy and item status; this crate only consumes it. The
//! [`TrackerClient`] trait is the narrow surface the scheduler drives;
//! [`http::HttpTracker`] is the production implementation.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Boxed future returned by [`TrackerClient`] methods (object safety).
pub type TrackerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Kind discriminator for schedulable work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    /// Mid-level item under an epic.
    Feature,
    /// Leaf item under a feature.
    Task,
}

impl WorkItemKind {
    /// Plural path segment used by the service's REST routes.
    #[must_use]
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Feature => "features",
            Self::Task => "tasks",
        }
    }
}

/// Item status as recorded by the tracking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    /// Never attempted.
    #[default]
    NotStarted,
    /// Work has been started.
    InProgress,
    /// Completed successfully.
    Completed,
    /// A blocker was reported.
    Blocked,
}

/// One schedulable work item, as returned by the tracking service.
///
/// The scheduler holds a read-mostly snapshot; the service stays
/// authoritative for status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Service-side identifier.
    pub id: String,
    /// Feature or task.
    #[serde(rename = "type")]
    pub kind: WorkItemKind,
    /// Short title.
    pub title: String,
    /// Longer description used to build the agent prompt.
    #[serde(default)]
    pub description: Option<String>,
    /// Position in the overall ordering (positive; ties are stable).
    pub execution_order: u32,
    /// Whether the item may run concurrently with group peers.
    #[serde(default)]
    pub can_parallelize: bool,
    /// Parallel-group tag; peers sharing a tag at the same order run
    /// together.
    #[serde(default)]
    pub parallel_group: Option<String>,
    /// Identifiers of items that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Current service-side status.
    #[serde(default)]
    pub status: WorkItemStatus,
}

/// Flat execution plan snapshot for one epic.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    /// All schedulable items, in service order.
    pub items: Vec<WorkItem>,
    /// Total item count reported by the service.
    pub total_items: usize,
}

/// Aggregate progress for one epic.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    /// Total schedulable items.
    pub total_items: u32,
    /// Items completed.
    pub completed: u32,
    /// Items currently in progress.
    #[serde(default)]
    pub in_progress: u32,
    /// Items with reported blockers.
    #[serde(default)]
    pub blocked: u32,
    /// Completion percentage (0–100).
    pub percent_complete: f64,
}

/// End-of-session report recorded against an epic.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotes {
    /// What the run accomplished.
    pub summary: String,
    /// Suggested follow-up work.
    pub next_steps: Vec<String>,
    /// Outstanding blockers.
    pub blockers: Vec<String>,
    /// Decisions taken during the run.
    pub decisions: Vec<String>,
}

/// A team known to the tracking service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    /// Service-side identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Fields for creating an epic, feature, or task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    /// Short title.
    pub title: String,
    /// Optional longer description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Narrow client interface to the tracking service.
///
/// All operations are safe to wrap in the retry engine; calls the
/// service itself de-duplicates (e.g. a double `start_session`) come
/// back as non-retryable client errors rather than being retried around.
pub trait TrackerClient: Send + Sync {
    /// Create an epic; returns its identifier.
    fn create_epic(&self, item: NewItem) -> TrackerFuture<'_, String>;

    /// Create a feature under an epic; returns its identifier.
    fn create_feature(&self, epic_id: &str, item: NewItem) -> TrackerFuture<'_, String>;

    /// Create a task under a feature; returns its identifier.
    fn create_task(&self, feature_id: &str, item: NewItem) -> TrackerFuture<'_, String>;

    /// Fetch the flat execution plan for an epic.
    fn get_execution_plan(&self, epic_id: &str) -> TrackerFuture<'_, ExecutionPlan>;

    /// Mark an item started.
    fn start_work(&self, kind: WorkItemKind, id: &str) -> TrackerFuture<'_, ()>;

    /// Mark an item completed, with an optional summary.
    fn complete_work(
        &self,
        kind: WorkItemKind,
        id: &str,
        summary: Option<String>,
    ) -> TrackerFuture<'_, ()>;

    /// Record a blocker against an item.
    fn report_blocker(&self, kind: WorkItemKind, id: &str, reason: &str) -> TrackerFuture<'_, ()>;

    /// Fetch aggregate progress for an epic.
    fn get_progress_summary(&self, epic_id: &str) -> TrackerFuture<'_, ProgressSummary>;

    /// Open a work session against an epic; returns the session id.
    fn start_session(&self, epic_id: &str) -> TrackerFuture<'_, String>;

    /// Close the epic's work session with end-of-run notes.
    fn end_session(&self, epic_id: &str, notes: SessionNotes) -> TrackerFuture<'_, ()>;

    /// List teams visible to the caller.
    fn list_teams(&self) -> TrackerFuture<'_, Vec<Team>>;
}
