use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use mailcheck_core::types::Job;
use mailcheck_storage::Database;

use crate::admin;
use crate::problem::ProblemResponse;
use crate::queue::{JobOutcome, JobQueue, JobReport, SubmitError};
use crate::tap::{
    parse_stage_list, tap_keep_alive, tap_stream, StageEvent, StageKind, TapFilter, TapHub,
};
use crate::telemetry;

pub const DUMMY_PAGE: &str = "<h1>This is a dummy page</h1>";

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    tap: TapHub,
    storage: Database,
    queue: JobQueue,
    homepage_populate_count: Option<i64>,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, tap: TapHub, storage: Database, queue: JobQueue) -> Self {
        Self {
            metrics,
            tap,
            storage,
            queue,
            homepage_populate_count: None,
        }
    }

    /// Makes the trigger page also submit a populate job of `count` records.
    pub fn with_homepage_populate_count(mut self, count: Option<i64>) -> Self {
        self.homepage_populate_count = count;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn tap(&self) -> &TapHub {
        &self.tap
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(homepage))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/jobs", post(submit_job))
        .route("/admin/processed-emails", get(admin::list_processed_emails))
        .route("/_debug/tap", get(debug_tap))
        .with_state(state)
}

/// Schedules the verify job and returns the static page whatever the queue says.
async fn homepage(State(state): State<AppState>) -> Html<&'static str> {
    counter!("homepage_requests_total").increment(1);

    let mut jobs = Vec::with_capacity(2);
    if let Some(count) = state.homepage_populate_count {
        jobs.push(Job::CreateProcessedEmails { count });
    }
    jobs.push(Job::VerifyProcessedEmails);

    for job in jobs {
        let task = job.name();
        if let Err(err) = state.queue().submit(job) {
            warn!(stage = "http", task, error = %err, "trigger page could not schedule job");
            state.tap().publish(
                StageEvent::new(StageKind::Http, "trigger.unscheduled")
                    .with_detail(serde_json::json!({ "task": task, "reason": err.to_string() })),
            );
        }
    }

    Html(DUMMY_PAGE)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct JobAccepted {
    id: Uuid,
    task: &'static str,
}

/// Body returned by `POST /jobs?wait=true` once the worker has run the job.
#[derive(Debug, Serialize)]
struct JobFinished {
    id: Uuid,
    task: &'static str,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    submitted_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl From<JobReport> for JobFinished {
    fn from(report: JobReport) -> Self {
        let outcome = report.outcome.label();
        let (message, error) = match report.outcome {
            JobOutcome::Succeeded(message) => (message, None),
            JobOutcome::Failed(reason) => (None, Some(reason)),
        };
        Self {
            id: report.id,
            task: report.task,
            outcome,
            message,
            error,
            submitted_at: report.submitted_at,
            finished_at: report.finished_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SubmitQuery {
    #[serde(default)]
    wait: bool,
}

/// Submits a job. With `?wait=true` the response is held until the job finishes.
async fn submit_job(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    Json(job): Json<Job>,
) -> Result<Response, ProblemResponse> {
    let handle = state.queue().submit(job).map_err(|err| match err {
        SubmitError::QueueFull => ProblemResponse::queue_unavailable("job queue is full"),
        SubmitError::Closed => ProblemResponse::queue_unavailable("job queue is not running"),
    })?;

    if !query.wait {
        let accepted = JobAccepted {
            id: handle.id(),
            task: handle.task(),
        };
        return Ok((StatusCode::ACCEPTED, Json(accepted)).into_response());
    }

    let report = handle.wait().await.map_err(|err| {
        error!(stage = "http", error = %err, "job ended without a report");
        ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "job_abandoned", err.to_string())
    })?;

    Ok((StatusCode::OK, Json(JobFinished::from(report))).into_response())
}

#[derive(Debug, Deserialize)]
struct TapQuery {
    #[serde(default)]
    s: Option<String>,
}

async fn debug_tap(
    State(state): State<AppState>,
    Query(query): Query<TapQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>>,
    (StatusCode, String),
> {
    let stages = parse_stage_list(query.s).map_err(|err| (StatusCode::BAD_REQUEST, err))?;
    let stream = tap_stream(state.tap().clone(), TapFilter::from_stages(stages));

    Ok(Sse::new(stream).keep_alive(tap_keep_alive()))
}
