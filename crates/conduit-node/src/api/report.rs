//! Report intake.

use axum::{extract::State, http::StatusCode, Json};
use conduit_core::Report;
use serde::Serialize;

use crate::aggregator::Intake;
use crate::state::AppState;

/// Answer to a report.
#[derive(Debug, Serialize)]
pub struct ReportAck {
    /// `queued` or `dropped`.
    pub status: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Accept a handler report. Dropped reports are still answered 202.
pub async fn submit_report(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<ReportAck>), (StatusCode, String)> {
    let report: Report = serde_json::from_str(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid report: {}", e)))?;

    let ack = match state.aggregator.submit(report).await {
        Intake::Queued => ReportAck {
            status: "queued",
            reason: None,
        },
        Intake::Dropped(reason) => ReportAck {
            status: "dropped",
            reason: Some(reason.to_string()),
        },
    };
    Ok((StatusCode::ACCEPTED, Json(ack)))
}
