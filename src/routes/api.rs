use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{authorize, error_response, timestamp};
use crate::model::{ScorePatch, SubScores};
use crate::state::AppState;

pub async fn begin_verification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(submission_id): Path<Uuid>,
) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    match state.engine.begin_peer_verification(submission_id, Utc::now()).await {
        Ok(result) => Json(serde_json::json!({
            "success": true,
            "timestamp": timestamp(),
            "submission_id": submission_id,
            "assigned": result.created.len(),
            "shortfall": result.shortfall,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct ReviewBody {
    reviewer_id: Uuid,
    clarity: u8,
    argument: u8,
    style: u8,
    moral_depth: u8,
    #[serde(default)]
    justification: String,
}

pub async fn submit_review(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(assignment_id): Path<Uuid>,
    Json(body): Json<ReviewBody>,
) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    let scores = SubScores::new(body.clarity, body.argument, body.style, body.moral_depth);
    match state
        .engine
        .complete_review(assignment_id, body.reviewer_id, scores, body.justification, Utc::now())
        .await
    {
        Ok(outcome) => Json(serde_json::json!({
            "success": true,
            "timestamp": timestamp(),
            "review_id": outcome.review.id,
            "score": outcome.score,
            "outcome": outcome.outcome,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct OverrideBody {
    admin_id: Uuid,
    #[serde(flatten)]
    patch: ScorePatch,
}

pub async fn override_review(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(review_id): Path<Uuid>,
    Json(body): Json<OverrideBody>,
) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    match state
        .engine
        .override_review(review_id, body.patch, body.admin_id, Utc::now())
        .await
    {
        Ok(outcome) => Json(serde_json::json!({
            "success": true,
            "timestamp": timestamp(),
            "review": outcome.review,
            "score": outcome.score,
            "outcome": outcome.outcome,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn shortlist(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(contest_id): Path<Uuid>,
) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    match state.engine.select_shortlist(contest_id, Utc::now()).await {
        Ok(finalists) => Json(serde_json::json!({
            "success": true,
            "timestamp": timestamp(),
            "finalists": finalists,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub struct ScoreQuery {
    requester: Uuid,
}

pub async fn peer_score(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(submission_id): Path<Uuid>,
    Query(query): Query<ScoreQuery>,
) -> impl IntoResponse {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }

    match state.engine.author_view(submission_id, query.requester).await {
        Ok(view) => Json(serde_json::json!({
            "success": true,
            "timestamp": timestamp(),
            "view": view,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}
