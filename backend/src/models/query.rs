use serde::{Deserialize, Serialize};

use crate::validation::SafetyViolation;

/// Column metadata of an executed query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    /// Declared type when the column maps directly to a table column
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: usize,
    /// Set when the row cap was reached; more rows may exist
    pub truncated: bool,
    pub execution_time_ms: u64,
    /// SQL actually executed, after limit injection
    pub sql: String,
}

/// Candidate SQL held between generation and explicit confirmation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySession {
    pub dataset_id: String,
    pub candidate_sql: String,
}

/// Orchestrator stages for a single natural-language request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    BuildingContext,
    AwaitingGeneration,
    Validating,
    AwaitingConfirmation,
    Executing,
    Done,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
}

#[derive(Debug, Deserialize)]
pub struct NaturalLanguageQueryRequest {
    pub prompt: String,
    #[serde(default)]
    pub autorun: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NaturalLanguageQueryResponse {
    pub sql: String,
    pub autorun: bool,
    pub results: Option<ExecutionResult>,
    /// Final stage reached: `done`, `awaiting_confirmation` or `failed`
    pub stage: QueryStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<QuerySession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<SafetyViolation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub results: ExecutionResult,
}
