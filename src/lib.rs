pub mod backend;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod state;

use axum::{
    routing::{get, post},
    Router,
};
use backend::{registry::ModelRegistry, BackendError};
use config::AppConfig;
use tracing::info;

/// Creates the configured model handle. Loading can be slow (local weights),
/// so it runs on the blocking pool.
pub async fn build_state(config: &AppConfig) -> Result<state::AppState, BackendError> {
    let registry = ModelRegistry::with_default_engines()?;
    info!(engines = ?registry.engines(), "model registry ready");

    let engine = config.engine.clone();
    let model = config.model.clone();
    let model_config = config.model_config.clone();
    let handle = tokio::task::spawn_blocking(move || registry.create(&engine, model, model_config))
        .await
        .map_err(|error| BackendError::ModelLoad(format!("model loader task failed: {error}")))??;

    Ok(state::AppState::new(handle))
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .with_state(state)
}
