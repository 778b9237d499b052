use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;

use mailcheck_core::types::ProcessedEmail;

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// One row of the admin listing; only the displayed columns.
#[derive(Debug, Serialize)]
pub struct ProcessedEmailListItem {
    pub email: String,
    pub is_verified: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<ProcessedEmail> for ProcessedEmailListItem {
    fn from(record: ProcessedEmail) -> Self {
        Self {
            email: record.email,
            is_verified: record.is_verified,
            timestamp: record.timestamp,
        }
    }
}

/// Lists every processed email, newest timestamp first.
pub async fn list_processed_emails(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProcessedEmailListItem>>, ProblemResponse> {
    let records = state
        .storage()
        .processed_emails()
        .list_recent_first()
        .await
        .map_err(|err| {
            error!(stage = "http", error = %err, "failed to list processed emails");
            ProblemResponse::storage("failed to load processed emails")
        })?;

    Ok(Json(records.into_iter().map(Into::into).collect()))
}
