//! Admin endpoint: POST /admin/run-job/{name}.
//!
//! Runs a registered job in the request task, bypassing the queue, the same
//! way the CLI does. Guarded by `admin.secret` as a bearer token; with no
//! secret configured the endpoint refuses every request.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use defidash_jobs::JobArgs;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;

type ApiError = (StatusCode, Json<Value>);

pub async fn run_job_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let Some(secret) = state.config.admin.secret.as_deref() else {
        warn!(job = %name, "admin request refused: admin.secret is not configured");
        return Err(error(StatusCode::FORBIDDEN, "admin endpoint is disabled"));
    };

    verify_bearer_token(&headers, secret).map_err(|e| {
        warn!(job = %name, reason = %e, "admin request unauthorized");
        error(StatusCode::UNAUTHORIZED, "unauthorized")
    })?;

    let args = parse_body(&body).map_err(|e| {
        warn!(job = %name, error = %e, "invalid admin request body");
        error(StatusCode::BAD_REQUEST, &e)
    })?;

    if !state.runner.registry().contains_job(&name) {
        return Err(error(StatusCode::NOT_FOUND, "unknown job"));
    }

    info!(job = %name, args = %args, "job triggered over http");
    let outcome = state.runner.run_job(&name, args).await;
    Ok(Json(json!({
        "job": name,
        "outcome": outcome.to_string(),
        "ok": outcome.is_success(),
    })))
}

fn error(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "error": message })))
}

/// An empty body means no arguments; anything else must be a JSON object.
fn parse_body(body: &Bytes) -> Result<JobArgs, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(JobArgs::new());
    }
    serde_json::from_slice::<Map<String, Value>>(body)
        .map(JobArgs::from)
        .map_err(|e| format!("body must be a JSON object: {e}"))
}

/// Check `Authorization: Bearer <token>` against the configured secret.
fn verify_bearer_token(headers: &HeaderMap, expected: &str) -> Result<(), String> {
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Authorization header".to_string())?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| "Authorization header must use Bearer scheme".to_string())?;

    if token == expected {
        Ok(())
    } else {
        Err("bearer token mismatch".to_string())
    }
}
