pub mod ingest;
pub mod llm_service;
pub mod orchestrator;
pub mod query_executor;
pub mod schema_context;
pub mod session_store; // Dataset registry with TTL sweep

pub use ingest::{IngestService, ValidationError};
pub use llm_service::*;
pub use orchestrator::*;
pub use query_executor::*;
pub use schema_context::*;
pub use session_store::*;
