use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::path::Path;

use super::inference::{parse_integer, parse_real, InferredTable};
use super::ValidationError;
use crate::api::middleware::AppError;
use crate::models::{ColumnType, IngestWarning, TableSchema};
use crate::storage::{sqlite::remove_if_exists, StoreHandle};

/// Result of loading one upload into its store
#[derive(Debug)]
pub struct ConversionOutput {
    pub store: StoreHandle,
    pub schema: TableSchema,
    pub warnings: Vec<IngestWarning>,
}

/// Bounded warning list; anything past the cap is only counted
#[derive(Debug)]
struct WarningLog {
    max: usize,
    entries: Vec<IngestWarning>,
    suppressed: u64,
}

impl WarningLog {
    fn new(max: usize) -> Self {
        Self {
            max,
            entries: Vec::new(),
            suppressed: 0,
        }
    }

    fn push(&mut self, warning: IngestWarning) {
        if self.entries.len() < self.max {
            self.entries.push(warning);
        } else {
            self.suppressed += 1;
        }
    }

    fn finish(mut self) -> Vec<IngestWarning> {
        if self.suppressed > 0 {
            self.entries.push(IngestWarning::suppressed(self.suppressed));
        }
        self.entries
    }
}

/// Quote an identifier for SQLite
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct StoreConverter;

impl StoreConverter {
    /// Load every record of `table` into a fresh store at `path`. The file
    /// is removed again if loading fails part way.
    pub fn convert(table: &InferredTable, path: &Path, max_warnings: usize) -> Result<ConversionOutput, AppError> {
        remove_if_exists(path).map_err(|e| AppError::Internal(format!("Could not clear store path: {}", e)))?;

        let result = StoreHandle::create(path)
            .map_err(AppError::from)
            .and_then(|mut conn| Self::load(&mut conn, table, max_warnings));

        match result {
            Ok((schema, warnings)) => Ok(ConversionOutput {
                store: StoreHandle::new(path.to_path_buf(), schema.table_name.clone()),
                schema,
                warnings,
            }),
            Err(e) => {
                if let Err(io_err) = remove_if_exists(path) {
                    tracing::warn!("Could not remove partial store {}: {}", path.display(), io_err);
                }
                Err(e)
            }
        }
    }

    fn load(
        conn: &mut Connection,
        table: &InferredTable,
        max_warnings: usize,
    ) -> Result<(TableSchema, Vec<IngestWarning>), AppError> {
        let mut schema = table.schema.clone();
        let types = table.column_types();
        let width = types.len();
        let mut warnings = WarningLog::new(max_warnings);
        let mut saw_null = vec![false; width];
        let mut row_count: u64 = 0;

        let tx = conn.transaction()?;
        tx.execute_batch(&create_table_sql(&schema))?;
        {
            let mut insert = tx.prepare(&insert_sql(&schema))?;
            for record in table.source.records() {
                let record = record.map_err(|e| ValidationError::Format(format!("Malformed record: {}", e)))?;
                row_count += 1;

                if record.len() != width {
                    warnings.push(IngestWarning::ragged_row(row_count, width, record.len()));
                }

                let mut values = Vec::with_capacity(width);
                for (idx, column_type) in types.iter().enumerate() {
                    let raw = record.get(idx).unwrap_or("");
                    let value = coerce(raw, *column_type);
                    if value.is_none() {
                        let column = &schema.columns[idx].name;
                        warnings.push(IngestWarning::coercion_failed(row_count, column, *column_type, raw.trim()));
                    }
                    let value = value.unwrap_or(Value::Null);
                    if value == Value::Null {
                        saw_null[idx] = true;
                    }
                    values.push(value);
                }

                insert.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        for (column, nullable) in schema.columns.iter_mut().zip(saw_null) {
            column.nullable = nullable;
        }
        schema.row_count = row_count;

        let warnings = warnings.finish();
        tracing::info!(
            table = %schema.table_name,
            rows = row_count,
            columns = width,
            warnings = warnings.len(),
            "Loaded dataset store"
        );
        Ok((schema, warnings))
    }
}

/// Convert one raw field to its column's storage value. Blank fields are
/// NULL; `None` means the text did not fit the column type.
fn coerce(raw: &str, column_type: ColumnType) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(Value::Null);
    }
    match column_type {
        ColumnType::Integer => parse_integer(trimmed).map(Value::Integer),
        ColumnType::Real => parse_real(trimmed).map(Value::Real),
        ColumnType::Text => Some(Value::Text(raw.to_string())),
    }
}

fn create_table_sql(schema: &TableSchema) -> String {
    let columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_identifier(&c.name), c.data_type.as_sql()))
        .collect();
    format!(
        "CREATE TABLE {} ({})",
        quote_identifier(&schema.table_name),
        columns.join(", ")
    )
}

fn insert_sql(schema: &TableSchema) -> String {
    let names: Vec<String> = schema.columns.iter().map(|c| quote_identifier(&c.name)).collect();
    let placeholders: Vec<String> = (1..=schema.columns.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(&schema.table_name),
        names.join(", "),
        placeholders.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WarningKind;
    use crate::services::ingest::inference::{infer_schema, InferenceOptions};
    use tempfile::tempdir;

    fn convert_text(text: &str, max_warnings: usize) -> (tempfile::TempDir, ConversionOutput) {
        let dir = tempdir().unwrap();
        let table = infer_schema(text.as_bytes(), Some("data.csv"), "ds_test", &InferenceOptions::default()).unwrap();
        let path = dir.path().join("test.sqlite");
        let output = StoreConverter::convert(&table, &path, max_warnings).unwrap();
        (dir, output)
    }

    #[test]
    fn test_rows_are_loaded_with_types() {
        let (_dir, output) = convert_text("id,name,score\n1,Alice,9.5\n2,Bob,\n3,Carol,7\n", 100);
        assert_eq!(output.schema.row_count, 3);
        assert!(output.warnings.is_empty());
        assert!(output.schema.columns[2].nullable);
        assert!(!output.schema.columns[0].nullable);

        let conn = output.store.open_read_only().unwrap();
        let (count, total): (i64, f64) = conn
            .query_row("SELECT COUNT(*), SUM(score) FROM ds_test", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 3);
        assert!((total - 16.5).abs() < f64::EPSILON);

        let kind: String = conn
            .query_row("SELECT typeof(id) FROM ds_test LIMIT 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kind, "integer");
    }

    #[test]
    fn test_coercion_failure_becomes_null_with_warning() {
        // Only the first value is sampled, so "oops" is found during loading
        let mut text = String::from("n\n1\n");
        let table_opts = InferenceOptions {
            inference_sample_size: 1,
            ..InferenceOptions::default()
        };
        text.push_str("oops\n3\n");
        let dir = tempdir().unwrap();
        let table = infer_schema(text.as_bytes(), None, "ds_test", &table_opts).unwrap();
        let path = dir.path().join("t.sqlite");
        let output = StoreConverter::convert(&table, &path, 100).unwrap();

        assert_eq!(output.schema.row_count, 3);
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(output.warnings[0].kind, WarningKind::CoercionFailed);
        assert_eq!(output.warnings[0].row, Some(2));
        assert!(output.schema.columns[0].nullable);

        let conn = output.store.open_read_only().unwrap();
        let nulls: i64 = conn
            .query_row("SELECT COUNT(*) FROM ds_test WHERE n IS NULL", [], |row| row.get(0))
            .unwrap();
        assert_eq!(nulls, 1);
    }

    #[test]
    fn test_ragged_rows_are_padded_and_reported() {
        let (_dir, output) = convert_text("a,b,c\n1,2,3\n4,5\n6,7,8\n9,10,11\n12,13,14\n15,16,17\n18,19,20\n21,22,23\n24,25,26\n27,28,29\n", 100);
        assert_eq!(output.schema.row_count, 10);
        assert_eq!(output.warnings.len(), 1);
        assert_eq!(output.warnings[0].kind, WarningKind::RaggedRow);
        assert_eq!(output.warnings[0].row, Some(2));
    }

    #[test]
    fn test_warnings_are_capped_with_summary() {
        let mut text = String::from("n\n1\n");
        for _ in 0..5 {
            text.push_str("bad\n");
        }
        let options = InferenceOptions {
            inference_sample_size: 1,
            ..InferenceOptions::default()
        };
        let dir = tempdir().unwrap();
        let table = infer_schema(text.as_bytes(), None, "ds_test", &options).unwrap();
        let output = StoreConverter::convert(&table, &dir.path().join("t.sqlite"), 2).unwrap();

        assert_eq!(output.warnings.len(), 3);
        assert_eq!(output.warnings[2].kind, WarningKind::Suppressed);
        assert!(output.warnings[2].message.starts_with('3'));
    }

    #[test]
    fn test_text_keeps_surrounding_whitespace() {
        let (_dir, output) = convert_text("id,label\n1, padded \n", 100);
        let conn = output.store.open_read_only().unwrap();
        let label: String = conn
            .query_row("SELECT label FROM ds_test", [], |row| row.get(0))
            .unwrap();
        assert_eq!(label, " padded ");
    }

    #[test]
    fn test_existing_file_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sqlite");
        std::fs::write(&path, b"stale").unwrap();

        let table = infer_schema(b"x\n1\n", None, "ds_test", &InferenceOptions::default()).unwrap();
        let output = StoreConverter::convert(&table, &path, 10).unwrap();
        assert_eq!(output.schema.row_count, 1);
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("name"), "\"name\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
