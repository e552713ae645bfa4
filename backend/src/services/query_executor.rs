use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode};
use serde_json::{Map, Number, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::middleware::AppError;
use crate::config::QueryConfig;
use crate::models::{ColumnMeta, ExecutionResult};
use crate::storage::StoreHandle;

/// SQLite VM instructions between deadline checks
const PROGRESS_CHECK_OPS: i32 = 1_000;

type Rows = Vec<Map<String, Value>>;

/// Runs validated SQL against a dataset store with a row cap and a hard
/// wall-clock timeout
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    row_cap: u64,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(row_cap: u64, timeout: Duration) -> Self {
        Self { row_cap, timeout }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(config.row_cap, Duration::from_secs(config.timeout_secs))
    }

    pub fn row_cap(&self) -> u64 {
        self.row_cap
    }

    pub async fn execute(&self, store: &StoreHandle, sql: &str) -> Result<ExecutionResult, AppError> {
        let start_time = Instant::now();
        let deadline = start_time + self.timeout;

        let handle = store.clone();
        let conn = tokio::task::spawn_blocking(move || handle.open_read_only())
            .await?
            .map_err(|e| {
                tracing::warn!("Could not open store {}: {}", store.path().display(), e);
                AppError::NotFound("Dataset store is no longer available".to_string())
            })?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let interrupt = conn.get_interrupt_handle();
        {
            let cancelled = cancelled.clone();
            conn.progress_handler(
                PROGRESS_CHECK_OPS,
                Some(move || cancelled.load(Ordering::Relaxed) || Instant::now() >= deadline),
            )?;
        }

        let owned_sql = sql.to_string();
        let row_cap = self.row_cap;
        let task = tokio::task::spawn_blocking(move || run_query(conn, &owned_sql, row_cap));

        let (columns, rows) = match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined?.map_err(|e| self.map_error(e))?,
            Err(_) => {
                cancelled.store(true, Ordering::Relaxed);
                interrupt.interrupt();
                tracing::warn!(sql_len = sql.len(), "Query exceeded {:?} and was interrupted", self.timeout);
                return Err(AppError::Timeout(self.timeout.as_secs()));
            }
        };

        let row_count = rows.len();
        let truncated = row_count as u64 >= self.row_cap;
        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        tracing::info!(
            rows = row_count,
            truncated,
            execution_time_ms,
            "Query executed"
        );

        Ok(ExecutionResult {
            columns,
            rows,
            row_count,
            truncated,
            execution_time_ms,
            sql: sql.to_string(),
        })
    }

    fn map_error(&self, err: rusqlite::Error) -> AppError {
        // Errors raised by SQLite for the statement itself, such as an
        // unknown column, are the caller's to fix
        if let rusqlite::Error::SqlInputError { msg, offset, .. } = &err {
            return AppError::BadRequest(format!("Query failed: {} at offset {}", msg, offset));
        }
        match err.sqlite_error_code() {
            Some(ErrorCode::OperationInterrupted) => {
                tracing::warn!("Query interrupted at its deadline of {:?}", self.timeout);
                AppError::Timeout(self.timeout.as_secs())
            }
            Some(_) => AppError::BadRequest(format!("Query failed: {}", err)),
            None => AppError::from(err),
        }
    }
}

/// Read at most `row_cap` rows inside a transaction that is rolled back
fn run_query(mut conn: Connection, sql: &str, row_cap: u64) -> Result<(Vec<ColumnMeta>, Rows), rusqlite::Error> {
    let tx = conn.transaction()?;
    let result = {
        let mut stmt = tx.prepare(sql)?;
        let columns: Vec<ColumnMeta> = stmt
            .columns()
            .iter()
            .map(|c| ColumnMeta {
                name: c.name().to_string(),
                declared_type: c.decl_type().map(str::to_string),
            })
            .collect();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while (rows.len() as u64) < row_cap {
            let Some(row) = cursor.next()? else {
                break;
            };
            let mut object = Map::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                object.insert(column.name.clone(), to_json(row.get_ref(idx)?));
            }
            rows.push(object);
        }
        (columns, rows)
    };
    tx.rollback()?;
    Ok(result)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn store_with(sql: &str) -> (TempDir, StoreHandle) {
        let dir = tempdir().unwrap();
        let path = StoreHandle::path_for(dir.path(), "t");
        let conn = StoreHandle::create(&path).unwrap();
        conn.execute_batch(sql).unwrap();
        (dir, StoreHandle::new(path, "t"))
    }

    fn numbers_store(count: usize) -> (TempDir, StoreHandle) {
        let mut sql = String::from("CREATE TABLE t (n INTEGER, label TEXT);");
        for i in 0..count {
            sql.push_str(&format!("INSERT INTO t VALUES ({}, 'row {}');", i, i));
        }
        store_with(&sql)
    }

    #[tokio::test]
    async fn test_rows_are_returned_in_column_order() {
        let (_dir, store) = numbers_store(3);
        let executor = QueryExecutor::new(100, Duration::from_secs(5));

        let result = executor
            .execute(&store, "SELECT label, n FROM t ORDER BY n")
            .await
            .unwrap();

        assert_eq!(result.row_count, 3);
        assert!(!result.truncated);
        assert_eq!(result.columns[0].name, "label");
        assert_eq!(result.columns[0].declared_type.as_deref(), Some("TEXT"));
        let keys: Vec<&String> = result.rows[0].keys().collect();
        assert_eq!(keys, vec!["label", "n"]);
        assert_eq!(result.rows[2]["n"], json!(2));
        assert_eq!(result.sql, "SELECT label, n FROM t ORDER BY n");
    }

    #[tokio::test]
    async fn test_row_cap_truncates() {
        let (_dir, store) = numbers_store(10);
        let executor = QueryExecutor::new(4, Duration::from_secs(5));

        let result = executor.execute(&store, "SELECT * FROM t").await.unwrap();
        assert_eq!(result.row_count, 4);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_null_and_empty_string_are_distinct() {
        let (_dir, store) = store_with("CREATE TABLE t (v TEXT); INSERT INTO t VALUES (NULL), ('');");
        let executor = QueryExecutor::new(100, Duration::from_secs(5));

        let result = executor.execute(&store, "SELECT v FROM t ORDER BY rowid").await.unwrap();
        assert_eq!(result.rows[0]["v"], Value::Null);
        assert_eq!(result.rows[1]["v"], json!(""));
    }

    #[tokio::test]
    async fn test_value_mapping() {
        let (_dir, store) = store_with("CREATE TABLE t (a INTEGER); INSERT INTO t VALUES (1);");
        let executor = QueryExecutor::new(100, Duration::from_secs(5));

        let result = executor
            .execute(&store, "SELECT 1.5 AS r, x'0102' AS b, 'hi' AS s, a + 1 AS expr FROM t")
            .await
            .unwrap();
        let row = &result.rows[0];
        assert_eq!(row["r"], json!(1.5));
        assert_eq!(row["b"], json!("<blob 2 bytes>"));
        assert_eq!(row["s"], json!("hi"));
        assert_eq!(row["expr"], json!(2));
        assert!(result.columns[3].declared_type.is_none());
    }

    #[tokio::test]
    async fn test_store_cannot_be_modified() {
        let (_dir, store) = numbers_store(1);
        let executor = QueryExecutor::new(100, Duration::from_secs(5));

        let result = executor.execute(&store, "DELETE FROM t").await;
        assert!(result.is_err());

        let result = executor.execute(&store, "SELECT COUNT(*) AS c FROM t").await.unwrap();
        assert_eq!(result.rows[0]["c"], json!(1));
    }

    #[tokio::test]
    async fn test_runaway_query_times_out() {
        let (_dir, store) = numbers_store(1);
        let executor = QueryExecutor::new(100, Duration::from_millis(200));

        let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c";
        let started = Instant::now();
        let err = executor.execute(&store, sql).await.unwrap_err();

        assert!(matches!(err, AppError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sqlite_errors_are_bad_requests() {
        let (_dir, store) = numbers_store(1);
        let executor = QueryExecutor::new(100, Duration::from_secs(5));

        let err = executor.execute(&store, "SELECT missing FROM t").await.unwrap_err();
        match err {
            AppError::BadRequest(message) => assert!(message.contains("no such column")),
            other => panic!("expected a bad request, got {:?}", other),
        }

        let err = executor.execute(&store, "SELECT json('{') FROM t").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_store_is_usable_after_deadline() {
        let (_dir, store) = numbers_store(3);
        let slow = QueryExecutor::new(100, Duration::from_millis(100));
        let sql = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT MAX(x) FROM c";
        assert!(matches!(slow.execute(&store, sql).await, Err(AppError::Timeout(_))));

        let executor = QueryExecutor::new(100, Duration::from_secs(5));
        let result = executor.execute(&store, "SELECT COUNT(*) AS c FROM t").await.unwrap();
        assert_eq!(result.rows[0]["c"], json!(3));
    }

    #[tokio::test]
    async fn test_missing_store_is_not_found() {
        let (_dir, store) = numbers_store(1);
        store.release().unwrap();
        let executor = QueryExecutor::new(100, Duration::from_secs(5));

        let err = executor.execute(&store, "SELECT * FROM t").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
