use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::app::AppState;

/// GET /health: liveness probe with build metadata and queue depth.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pending = state.queue.len().map_err(|e| {
        error!(error = %e, "health check could not read the queue");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable", "error": "database unavailable"})),
        )
    })?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("DEFIDASH_GIT_SHA"),
        "pending_jobs": pending,
    })))
}

#[cfg(test)]
mod tests {
    use crate::app::{build_router, json_body, test_state};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use defidash_jobs::JobArgs;
    use tower::ServiceExt;

    #[tokio::test]
    async fn reports_pending_job_count() {
        let state = test_state(None);
        state.queue.enqueue("cleanup", JobArgs::new()).unwrap();
        state.queue.enqueue("help", JobArgs::new()).unwrap();

        let resp = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pending_jobs"], 2);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
