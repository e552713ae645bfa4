use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column storage type decided by inference
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    /// Header text as it appeared in the uploaded file
    pub original_name: String,
    #[serde(rename = "type")]
    pub data_type: ColumnType,
    pub nullable: bool,
    pub sample_values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnSchema>,
    pub row_count: u64,
}

impl TableSchema {
    /// Table name for a dataset id: `ds_` followed by the id's hex digits
    pub fn table_name_for(dataset_id: &str) -> String {
        let hex: String = dataset_id
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        format!("ds_{}", hex)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedDataset {
    pub id: String,
    pub filename: String,
    pub byte_size: u64,
    pub encoding: String,
    pub delimiter: char,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub schema: TableSchema,
}

impl UploadedDataset {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// A value in a numeric column did not coerce and was stored as NULL
    CoercionFailed,
    /// A record had a different field count than the header
    RaggedRow,
    /// Further warnings were not recorded individually
    Suppressed,
}

/// Non-fatal problem found while converting an upload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestWarning {
    pub kind: WarningKind,
    /// 1-based data row number (header excluded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub message: String,
}

impl IngestWarning {
    pub fn coercion_failed(row: u64, column: &str, expected: ColumnType, value: &str) -> Self {
        let mut preview: String = value.chars().take(40).collect();
        if preview.len() < value.len() {
            preview.push_str("...");
        }
        Self {
            kind: WarningKind::CoercionFailed,
            row: Some(row),
            column: Some(column.to_string()),
            message: format!("Value '{}' is not a valid {}; stored as NULL", preview, expected),
        }
    }

    pub fn ragged_row(row: u64, expected: usize, found: usize) -> Self {
        let action = if found < expected {
            "missing fields stored as NULL"
        } else {
            "extra fields ignored"
        };
        Self {
            kind: WarningKind::RaggedRow,
            row: Some(row),
            column: None,
            message: format!("Expected {} fields but found {}; {}", expected, found, action),
        }
    }

    pub fn suppressed(count: u64) -> Self {
        Self {
            kind: WarningKind::Suppressed,
            row: None,
            column: None,
            message: format!("{} further warnings were not listed", count),
        }
    }
}

/// Upload response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub dataset_id: String,
    pub filename: String,
    pub schema: TableSchema,
    pub warnings: Vec<IngestWarning>,
    pub expires_at: DateTime<Utc>,
}

/// Schema retrieval response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaResponse {
    pub dataset_id: String,
    pub filename: String,
    pub encoding: String,
    pub delimiter: String,
    pub schema: TableSchema,
    pub expires_at: DateTime<Utc>,
}

impl From<&UploadedDataset> for SchemaResponse {
    fn from(dataset: &UploadedDataset) -> Self {
        Self {
            dataset_id: dataset.id.clone(),
            filename: dataset.filename.clone(),
            encoding: dataset.encoding.clone(),
            delimiter: dataset.delimiter.to_string(),
            schema: dataset.schema.clone(),
            expires_at: dataset.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub filename: Option<String>,
}
