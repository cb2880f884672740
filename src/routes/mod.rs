mod api;
mod cron;

use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::error;

use crate::error::EngineError;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cron/deadlines", post(cron::deadlines))
        .route("/cron/warnings", post(cron::warnings))
        .route("/submissions/:submission_id/peer-verification", post(api::begin_verification))
        .route("/submissions/:submission_id/peer-score", get(api::peer_score))
        .route("/assignments/:assignment_id/review", post(api::submit_review))
        .route("/admin/reviews/:review_id/override", post(api::override_review))
        .route("/admin/contests/:contest_id/shortlist", post(api::shortlist))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "timestamp": timestamp() }))
}

pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Checks the scheduler's bearer credential against `CRON_SECRET`.
pub(crate) fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let secret = state
        .config
        .require_cron_secret()
        .map_err(|e| error_response(&e))?;

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented != Some(secret) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "success": false,
                "status": "unauthorized",
                "timestamp": timestamp(),
            })),
        )
            .into_response());
    }
    Ok(())
}

pub(crate) fn error_response(err: &EngineError) -> Response {
    let code = match err {
        EngineError::ConfigAbsent(_) | EngineError::InvalidPolicy { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidReview(_) | EngineError::AssignmentClosed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::StaleWrite(_) => StatusCode::CONFLICT,
        EngineError::Integrity(_) => {
            error!("Data integrity violation: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
        EngineError::Persistence(_) | EngineError::Dispatch(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        code,
        Json(serde_json::json!({
            "success": false,
            "status": err.status(),
            "error": err.to_string(),
            "timestamp": timestamp(),
        })),
    )
        .into_response()
}
