use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::handlers::dataset::AppState;
use crate::api::middleware::AppError;
use crate::models::{NaturalLanguageQueryRequest, NaturalLanguageQueryResponse, QueryRequest, QueryResponse};

/// Execute caller-supplied SQL against a dataset
pub async fn execute_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    tracing::info!("Executing SQL query for dataset: {}", id);

    let results = state.orchestrator.execute_confirmed(&id, &payload.sql).await?;
    Ok(Json(QueryResponse { results }))
}

/// Translate a question into SQL and, with `autorun`, execute it
pub async fn execute_natural_language_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<NaturalLanguageQueryRequest>,
) -> Result<Json<NaturalLanguageQueryResponse>, AppError> {
    tracing::info!("Executing natural language query for dataset: {}", id);

    let response = state
        .orchestrator
        .ask(&id, &payload.prompt, payload.autorun)
        .await?;
    Ok(Json(response))
}
