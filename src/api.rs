//! REST endpoints for triggering a triage run and reading back plans.
//!
//! Authentication is an external collaborator — these routes only require
//! the caller identity to be present in the `x-user-id` header.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::error;

use crate::error::PipelineError;
use crate::pipeline::{ActionPlan, TriagePipeline};
use crate::store::TriageStore;

/// How many recent plans the read route returns.
const PLAN_LIST_LIMIT: usize = 20;

/// Shared state for triage routes.
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<TriagePipeline>,
    pub store: Arc<dyn TriageStore>,
}

/// Response body for `POST /api/triage/run`.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_plan: Option<ActionPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            action_plan: None,
            warning: None,
            error: Some(error.into()),
        }
    }
}

/// POST /api/triage/run
///
/// Runs the full pipeline for the calling user. Partial persistence
/// failure still returns the plan, with a `warning` attached.
async fn run_triage(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(user_id) = caller_identity(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(RunResponse::failure("Sign in to catch up on messages")),
        )
            .into_response();
    };

    match state.pipeline.run(&user_id).await {
        Ok(outcome) => Json(RunResponse {
            success: true,
            warning: outcome.persistence.warning(),
            action_plan: Some(outcome.plan),
            error: None,
        })
        .into_response(),
        Err(PipelineError::Unauthorized) => (
            StatusCode::UNAUTHORIZED,
            Json(RunResponse::failure("Sign in to catch up on messages")),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Triage run failed");
            let message = match e {
                PipelineError::Fetch(_) => "Could not load your messages",
                PipelineError::Synthesis(_) => "Could not build your action plan",
                PipelineError::Unauthorized => unreachable!("handled above"),
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RunResponse::failure(message)),
            )
                .into_response()
        }
    }
}

/// GET /api/triage/plans
///
/// Recent action plans for the calling user, newest first.
async fn list_plans(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(user_id) = caller_identity(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Sign in to view plans"})),
        )
            .into_response();
    };

    match state.store.list_action_plans(&user_id, PLAN_LIST_LIMIT).await {
        Ok(plans) => Json(serde_json::json!({ "plans": plans })).into_response(),
        Err(e) => {
            error!(error = %e, "Plan listing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Could not load your plans"})),
            )
                .into_response()
        }
    }
}

fn caller_identity(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("x-user-id")?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

/// Build the triage REST routes.
pub fn triage_routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/triage/run", post(run_triage))
        .route("/api/triage/plans", get(list_plans))
        .with_state(state)
}
