use rusqlite::{Connection, OpenFlags, Result as SqliteResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const STORE_EXTENSION: &str = "sqlite";

/// Location of one dataset's SQLite store. The file holds exactly one table
/// and is never written after conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHandle {
    path: PathBuf,
    table_name: String,
}

impl StoreHandle {
    /// Store path for a dataset id inside `data_dir`
    pub fn path_for(data_dir: &Path, dataset_id: &str) -> PathBuf {
        data_dir.join(format!("{}.{}", dataset_id, STORE_EXTENSION))
    }

    pub fn new(path: PathBuf, table_name: impl Into<String>) -> Self {
        Self {
            path,
            table_name: table_name.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Open a new store file for bulk loading
    pub fn create(path: &Path) -> SqliteResult<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // The store is rebuilt from the upload on failure, so durability
        // settings are relaxed for load speed
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = OFF;
            PRAGMA synchronous = OFF;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Ok(conn)
    }

    /// Open the store for querying. The connection cannot write.
    pub fn open_read_only(&self) -> SqliteResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA query_only = ON;")?;
        Ok(conn)
    }

    /// Delete the store file. Connections that are still open keep working
    /// until they close.
    pub fn release(&self) -> io::Result<()> {
        remove_if_exists(&self.path)
    }
}

pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Ensure `data_dir` exists and remove store files left by a previous
/// process. Returns the number of files removed.
pub fn prepare_data_dir(data_dir: &Path) -> io::Result<usize> {
    fs::create_dir_all(data_dir)?;

    let mut removed = 0;
    for entry in fs::read_dir(data_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == STORE_EXTENSION) {
            remove_if_exists(&path)?;
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::info!("Removed {} stale dataset stores from {}", removed, data_dir.display());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn build_store(dir: &Path) -> StoreHandle {
        let path = StoreHandle::path_for(dir, "abc");
        let conn = StoreHandle::create(&path).unwrap();
        conn.execute_batch("CREATE TABLE ds_abc (id INTEGER); INSERT INTO ds_abc VALUES (1);")
            .unwrap();
        StoreHandle::new(path, "ds_abc")
    }

    #[test]
    fn test_read_only_connection_rejects_writes() {
        let dir = tempdir().unwrap();
        let store = build_store(dir.path());

        let conn = store.open_read_only().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ds_abc", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert!(conn.execute("INSERT INTO ds_abc VALUES (2)", []).is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = build_store(dir.path());

        store.release().unwrap();
        assert!(!store.path().exists());
        store.release().unwrap();
        assert!(store.open_read_only().is_err());
    }

    #[test]
    fn test_prepare_data_dir_removes_stale_stores() {
        let dir = tempdir().unwrap();
        build_store(dir.path());
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let removed = prepare_data_dir(dir.path()).unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_prepare_data_dir_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        assert_eq!(prepare_data_dir(&nested).unwrap(), 0);
        assert!(nested.is_dir());
    }
}
