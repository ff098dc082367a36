//! HTTP implementation of the tracking-service client.
//!
//! Transport failures become [`AppError::Network`] with the retryable
//! flag decided here (connect/timeout yes, definitive rejections no).
//! Non-2xx responses become [`AppError::Tracker`] with the status code
//! and the response body preserved verbatim, except 401/403 which map
//! to [`AppError::Auth`].

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::TrackerConfig;
use crate::tracker::{
    ExecutionPlan, NewItem, ProgressSummary, SessionNotes, Team, TrackerClient, TrackerFuture,
    WorkItem, WorkItemKind,
};
use crate::{AppError, Result};

/// `reqwest`-backed tracking-service client.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    base_url: String,
    api_token: Option<String>,
    http: Client,
}

/// Service response for resource creation.
#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

/// Wire shape of the execution-plan endpoint. The service may return
/// items pre-grouped into phases; the scheduler always rebuilds phases
/// locally, so the client flattens them back to one item list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanResponse {
    #[serde(default)]
    phases: Vec<PlanPhase>,
    total_items: usize,
}

#[derive(Debug, Deserialize)]
struct PlanPhase {
    #[serde(default)]
    items: Vec<WorkItem>,
}

impl HttpTracker {
    /// Build a client for the configured service.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &TrackerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_token: config.api_token.clone(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn request_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        decode_json(response).await
    }

    async fn request_empty(&self, request: RequestBuilder) -> Result<()> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        expect_success(response).await
    }
}

impl TrackerClient for HttpTracker {
    fn create_epic(&self, item: NewItem) -> TrackerFuture<'_, String> {
        Box::pin(async move {
            let request = self.http.post(self.url("/api/epics")).json(&item);
            let created: CreatedResponse = self.request_json(request).await?;
            Ok(created.id)
        })
    }

    fn create_feature(&self, epic_id: &str, item: NewItem) -> TrackerFuture<'_, String> {
        let path = format!("/api/epics/{epic_id}/features");
        Box::pin(async move {
            let request = self.http.post(self.url(&path)).json(&item);
            let created: CreatedResponse = self.request_json(request).await?;
            Ok(created.id)
        })
    }

    fn create_task(&self, feature_id: &str, item: NewItem) -> TrackerFuture<'_, String> {
        let path = format!("/api/features/{feature_id}/tasks");
        Box::pin(async move {
            let request = self.http.post(self.url(&path)).json(&item);
            let created: CreatedResponse = self.request_json(request).await?;
            Ok(created.id)
        })
    }

    fn get_execution_plan(&self, epic_id: &str) -> TrackerFuture<'_, ExecutionPlan> {
        let path = format!("/api/epics/{epic_id}/execution-plan");
        Box::pin(async move {
            let request = self.http.get(self.url(&path));
            let plan: PlanResponse = self.request_json(request).await?;
            let items: Vec<WorkItem> = plan
                .phases
                .into_iter()
                .flat_map(|phase| phase.items)
                .collect();
            debug!(items = items.len(), total = plan.total_items, "fetched execution plan");
            Ok(ExecutionPlan {
                items,
                total_items: plan.total_items,
            })
        })
    }

    fn start_work(&self, kind: WorkItemKind, id: &str) -> TrackerFuture<'_, ()> {
        let path = format!("/api/{}/{id}/start", kind.path_segment());
        Box::pin(async move { self.request_empty(self.http.post(self.url(&path))).await })
    }

    fn complete_work(
        &self,
        kind: WorkItemKind,
        id: &str,
        summary: Option<String>,
    ) -> TrackerFuture<'_, ()> {
        let path = format!("/api/{}/{id}/complete", kind.path_segment());
        Box::pin(async move {
            let request = self
                .http
                .post(self.url(&path))
                .json(&json!({ "summary": summary }));
            self.request_empty(request).await
        })
    }

    fn report_blocker(&self, kind: WorkItemKind, id: &str, reason: &str) -> TrackerFuture<'_, ()> {
        let path = format!("/api/{}/{id}/blockers", kind.path_segment());
        let reason = reason.to_owned();
        Box::pin(async move {
            let request = self
                .http
                .post(self.url(&path))
                .json(&json!({ "reason": reason }));
            self.request_empty(request).await
        })
    }

    fn get_progress_summary(&self, epic_id: &str) -> TrackerFuture<'_, ProgressSummary> {
        let path = format!("/api/epics/{epic_id}/progress");
        Box::pin(async move { self.request_json(self.http.get(self.url(&path))).await })
    }

    fn start_session(&self, epic_id: &str) -> TrackerFuture<'_, String> {
        let path = format!("/api/epics/{epic_id}/sessions");
        Box::pin(async move {
            let created: CreatedResponse =
                self.request_json(self.http.post(self.url(&path))).await?;
            Ok(created.id)
        })
    }

    fn end_session(&self, epic_id: &str, notes: SessionNotes) -> TrackerFuture<'_, ()> {
        let path = format!("/api/epics/{epic_id}/sessions/end");
        Box::pin(async move {
            let request = self.http.post(self.url(&path)).json(&notes);
            self.request_empty(request).await
        })
    }

    fn list_teams(&self) -> TrackerFuture<'_, Vec<Team>> {
        Box::pin(async move { self.request_json(self.http.get(self.url("/api/teams"))).await })
    }
}

// ── Response handling ─────────────────────────────────────────────────────────

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        response.json().await.map_err(|err| AppError::Network {
            message: format!("failed to decode tracker response: {err}"),
            retryable: false,
        })
    } else {
        Err(classify_status(status, body_text(response).await))
    }
}

async fn expect_success(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(classify_status(status, body_text(response).await))
    }
}

async fn body_text(response: Response) -> String {
    response.text().await.unwrap_or_default()
}

fn classify_status(status: StatusCode, body: String) -> AppError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::Auth(format!(
            "tracker rejected credentials ({status}): {body}"
        )),
        _ => AppError::Tracker {
            status: status.as_u16(),
            message: body,
        },
    }
}

fn map_transport_error(err: reqwest::Error) -> AppError {
    let retryable = err.is_timeout() || err.is_connect();
    AppError::Network {
        message: format!("tracker request failed: {err}"),
        retryable,
    }
}
