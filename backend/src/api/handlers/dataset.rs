use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::models::{SchemaResponse, UploadParams, UploadResponse};
use crate::services::{
    IngestService, LlmService, QueryExecutor, QueryOrchestrator, SchemaContextBuilder, SessionStore,
    SqlGenerator,
};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionStore>,
    pub ingest: Arc<IngestService>,
    pub orchestrator: Arc<QueryOrchestrator>,
}

impl AppState {
    /// Wire services from configuration, generating SQL through the
    /// configured LLM gateway
    pub fn new(config: Config) -> Result<Self, AppError> {
        let generator: Arc<dyn SqlGenerator> = Arc::new(LlmService::new(&config.llm)?);
        Ok(Self::with_generator(config, generator))
    }

    pub fn with_generator(config: Config, generator: Arc<dyn SqlGenerator>) -> Self {
        let sessions = Arc::new(SessionStore::new(config.session_ttl()));
        let ingest = Arc::new(IngestService::new(&config, sessions.clone()));
        let orchestrator = Arc::new(QueryOrchestrator::new(
            sessions.clone(),
            SchemaContextBuilder::from_config(&config.context),
            generator,
            QueryExecutor::from_config(&config.query),
        ));

        Self {
            config,
            sessions,
            ingest,
            orchestrator,
        }
    }
}

/// Upload a CSV file as the raw request body
pub async fn upload_dataset(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    tracing::info!(
        "Upload received: {} bytes, filename {:?}",
        body.len(),
        params.filename
    );

    let filename = params.filename.filter(|f| !f.trim().is_empty());
    let response = state.ingest.ingest(body, filename).await?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// Get the inferred schema of a dataset
pub async fn get_schema(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SchemaResponse>, AppError> {
    let dataset = state.sessions.get(&id).await?;
    Ok(Json(SchemaResponse::from(&dataset.metadata)))
}

/// Delete a dataset and its store before it expires
pub async fn delete_dataset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.sessions.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
