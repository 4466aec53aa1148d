//! HTTP API for the server

mod handlers;
mod sse;
mod types;

use crate::runtime::RuntimeManager;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeManager>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route("/api/conversations/:id", get(handlers::get_conversation))
        .route("/api/conversations/:id/chat", post(handlers::chat))
        .route("/api/conversations/:id/cancel", post(handlers::cancel))
        .route("/api/conversations/:id/archive", post(handlers::archive))
        .route(
            "/api/conversations/:id/subagents",
            get(handlers::list_subagents),
        )
        .route("/api/conversations/:id/stream", get(handlers::stream))
        .route("/api/models", get(handlers::models))
        .with_state(state)
}
