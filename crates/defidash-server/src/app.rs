use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use defidash_core::DashConfig;
use defidash_jobs::{JobRunner, Queue};

/// Shared state, passed as `Arc<AppState>` to every handler.
pub struct AppState {
    pub config: DashConfig,
    pub runner: JobRunner,
    pub queue: Queue,
}

impl AppState {
    pub fn new(config: DashConfig, runner: JobRunner) -> Self {
        let queue = runner.queue().clone();
        Self {
            config,
            runner,
            queue,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/admin/run-job/{name}",
            post(crate::http::admin::run_job_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
pub(crate) fn test_state(admin_secret: Option<&str>) -> Arc<AppState> {
    use defidash_jobs::Registry;
    use rusqlite::Connection;

    let mut builder = Registry::builder();
    crate::builtin::register(&mut builder).unwrap();
    let registry = Arc::new(builder.build().unwrap());
    let queue = Queue::new(Connection::open_in_memory().unwrap()).unwrap();
    let cache = defidash_cache::Cache::new(Connection::open_in_memory().unwrap()).unwrap();

    let mut config = DashConfig::default();
    config.admin.secret = admin_secret.map(str::to_string);
    Arc::new(AppState::new(config, JobRunner::new(registry, queue, cache)))
}

#[cfg(test)]
pub(crate) async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
