// Upload ingestion: bytes -> inferred schema -> per-dataset SQLite store
//
// Parsing and loading are blocking work and run on the blocking pool,
// bounded by a semaphore so large uploads cannot starve the runtime.

pub mod converter;
pub mod delimiter;
pub mod encoding;
pub mod headers;
pub mod inference;

use axum::body::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::models::{TableSchema, UploadResponse};
use crate::services::session_store::{NewDataset, SessionStore};
use crate::storage::StoreHandle;
use converter::StoreConverter;
use inference::{infer_schema, InferenceOptions};

/// Why an upload could not be turned into a dataset
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("The uploaded file is empty")]
    EmptyFile,

    #[error("The uploaded file is {size} bytes, larger than the {max} byte limit")]
    FileTooLarge { size: usize, max: usize },

    #[error("Files with extension '.{0}' are not supported; upload a CSV or TSV file")]
    UnsupportedFileType(String),

    #[error("{0}")]
    Encoding(String),

    #[error("{0}")]
    Format(String),

    #[error("The header row has no column names")]
    EmptyHeader,

    #[error("The file has a header but no data rows")]
    NoDataRows,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::EmptyFile => "EMPTY_FILE",
            ValidationError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            ValidationError::UnsupportedFileType(_) => "UNSUPPORTED_FILE_TYPE",
            ValidationError::Encoding(_) => "ENCODING_ERROR",
            ValidationError::Format(_) => "FORMAT_ERROR",
            ValidationError::EmptyHeader => "EMPTY_HEADER",
            ValidationError::NoDataRows => "NO_DATA_ROWS",
        }
    }
}

/// Turns uploads into registered datasets
pub struct IngestService {
    options: InferenceOptions,
    data_dir: PathBuf,
    max_warnings: usize,
    sessions: Arc<SessionStore>,
    permits: Arc<Semaphore>,
}

impl IngestService {
    pub fn new(config: &Config, sessions: Arc<SessionStore>) -> Self {
        let options = InferenceOptions {
            max_upload_bytes: config.ingest.max_upload_bytes,
            inference_sample_size: config.ingest.inference_sample_size,
            delimiter_sample_rows: config.ingest.delimiter_sample_rows,
            sample_values: config.ingest.sample_values,
            encodings: encoding::resolve_labels(&config.ingest.encodings),
        };
        let max_concurrent = config.max_concurrent_ingests();
        tracing::info!("Ingestion limited to {} concurrent uploads", max_concurrent);

        Self {
            options,
            data_dir: config.storage.data_dir.clone(),
            max_warnings: config.ingest.max_warnings,
            sessions,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Infer, convert and register one upload. Nothing is registered unless
    /// the store was fully written. The body buffer is shared with the
    /// blocking task rather than copied.
    pub async fn ingest(&self, bytes: Bytes, filename: Option<String>) -> Result<UploadResponse, AppError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::Internal(format!("Ingestion is shutting down: {}", e)))?;

        let id = self.sessions.allocate_id();
        let table_name = TableSchema::table_name_for(&id);
        let path = StoreHandle::path_for(&self.data_dir, &id);
        let byte_size = bytes.len() as u64;
        let display_name = filename.clone().unwrap_or_else(|| "upload.csv".to_string());

        tracing::info!("Ingesting {} ({} bytes) as dataset {}", display_name, byte_size, id);

        let options = self.options.clone();
        let max_warnings = self.max_warnings;
        let (converted, encoding, delimiter) = tokio::task::spawn_blocking(move || {
            let table = infer_schema(&bytes, filename.as_deref(), &table_name, &options)?;
            let output = StoreConverter::convert(&table, &path, max_warnings)?;
            Ok::<_, AppError>((output, table.encoding.name().to_string(), table.delimiter as char))
        })
        .await??;

        let dataset = self
            .sessions
            .register(NewDataset {
                id,
                filename: display_name,
                byte_size,
                encoding,
                delimiter,
                schema: converted.schema,
                store: converted.store,
            })
            .await?;

        Ok(UploadResponse {
            dataset_id: dataset.id().to_string(),
            filename: dataset.metadata.filename.clone(),
            schema: dataset.schema().clone(),
            warnings: converted.warnings,
            expires_at: dataset.metadata.expires_at,
        })
    }
}
