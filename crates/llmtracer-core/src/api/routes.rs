//! API routes

use axum::{
    middleware::from_fn_with_state,
    routing::{get, patch, post},
    Router,
};

use super::handlers::{self, AppState};
use super::middleware;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Ingestion
        .route("/traces", post(handlers::create_trace).get(handlers::list_traces))
        .route("/traces/:trace_id/spans", post(handlers::create_span))
        .route("/spans/:span_id/complete", patch(handlers::complete_span))
        .route("/traces/:trace_id/complete", patch(handlers::complete_trace))
        // Queries
        .route("/traces/:trace_id", get(handlers::get_trace))
        .route("/stats", get(handlers::get_stats))
        .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .with_state(state)
}
