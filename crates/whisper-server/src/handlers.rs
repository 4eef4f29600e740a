use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::{
    lifecycle::{CreateSecret, LifecycleError},
    AppState,
};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"status": "ok", "store": state.lifecycle.store().backend()}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub id: String,
}

pub async fn create_secret(
    State(state): State<AppState>,
    body: Result<Json<CreateSecret>, JsonRejection>,
) -> Response {
    // The rejection text can quote the offending input, so it is not echoed.
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"error": "request body too large"})),
            )
                .into_response();
        }
        Err(rejection) => {
            debug!(status = %rejection.status(), "rejected create body");
            return invalid(vec![
                "body must be a JSON object with ciphertext and iv".to_owned()
            ]);
        }
    };

    match state.lifecycle.create_secret(req).await {
        Ok(id) => Json(CreateResponse { id }).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Get ───────────────────────────────────────────────────────────────────────

pub async fn get_secret(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.lifecycle.retrieve_secret(&id).await {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn invalid(details: Vec<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "invalid secret", "details": details})),
    )
        .into_response()
}

fn error_response(e: LifecycleError) -> Response {
    match e {
        LifecycleError::Validation(details) => invalid(details),
        LifecycleError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not found or expired"})),
        )
            .into_response(),
        LifecycleError::Store(e) => {
            tracing::error!(error = %e, "store error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}
