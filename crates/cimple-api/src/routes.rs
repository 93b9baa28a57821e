//! API route definitions.

use axum::{
    Router,
    routing::get,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{agents, builds, health};
use crate::state::AppState;
use crate::ws;

/// Create the main API router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(build_routes())
        .merge(agent_routes())
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_routes() -> Router<Arc<AppState>> {
    Router::new().route("/builds", get(builds::list_builds).post(builds::submit_build))
}

fn agent_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/agents", get(agents::list_agents))
        .route("/agents/connection", get(ws::agent_connection))
}
