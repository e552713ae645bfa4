use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers::{dataset, query, AppState};

/// Request bodies may exceed the upload limit by this much, so oversized
/// uploads reach the ingest size check and get a structured error
const BODY_LIMIT_SLACK: usize = 1024;

/// Create router with application state
pub fn create_router_with_state(state: AppState) -> Router {
    let body_limit = state.config.ingest.max_upload_bytes.saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/datasets", post(dataset::upload_dataset))
        .route("/api/datasets/{id}", delete(dataset::delete_dataset))
        .route("/api/datasets/{id}/schema", get(dataset::get_schema))
        .route("/api/datasets/{id}/query", post(query::execute_query))
        .route(
            "/api/datasets/{id}/nl-query",
            post(query::execute_natural_language_query),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
