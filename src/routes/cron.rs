use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::{authorize, timestamp};
use crate::model::SweepReport;
use crate::state::AppState;

fn summary(stages: &[(&str, &SweepReport)]) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    let mut shortfalls = Vec::new();
    let mut errors = Vec::new();

    for (name, report) in stages {
        body.insert((*name).to_string(), serde_json::json!(report.processed));
        shortfalls.extend(report.shortfalls.iter().cloned());
        errors.extend(report.errors.iter().map(|e| format!("{}: {}", name, e)));
    }

    if !errors.is_empty() {
        warn!(errors = errors.len(), "Sweep finished with per-item errors");
    }

    body.insert("success".to_string(), serde_json::json!(errors.is_empty()));
    body.insert("timestamp".to_string(), serde_json::json!(timestamp()));
    body.insert("shortfalls".to_string(), serde_json::json!(shortfalls));
    body.insert("errors".to_string(), serde_json::json!(errors));
    serde_json::Value::Object(body)
}

/// Hourly: expire lapsed work, reassign it, retry allocation shortfalls and
/// send final reminders.
pub async fn deadlines(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    let now = Utc::now();
    let engine = &state.engine;
    let expired = engine.sweep_expired(now).await;
    let reassigned = engine.reassign_expired(now).await;
    let topped_up = engine.top_up_sweep(now).await;
    let reminders = engine.sweep_final_reminders(now).await;

    info!(
        expired = expired.processed,
        reassigned = reassigned.processed,
        topped_up = topped_up.processed,
        final_reminders = reminders.processed,
        "Deadline sweep complete"
    );

    Json(summary(&[
        ("expired", &expired),
        ("reassigned", &reassigned),
        ("topped_up", &topped_up),
        ("final_reminders_sent", &reminders),
    ]))
    .into_response()
}

/// Every six hours: 24-hour deadline warnings.
pub async fn warnings(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    let report = state.engine.sweep_warnings(Utc::now()).await;
    info!(sent = report.processed, "Warning sweep complete");

    Json(summary(&[("warnings_sent", &report)])).into_response()
}
