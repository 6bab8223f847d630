//! Read connection pool for queries outside a transaction.
//!
//! Uses r2d2 with r2d2_sqlite for pooled read access.
//! SQLite WAL mode lets these readers run while a writer holds the lock.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use std::path::Path;
use std::time::Duration;

use super::schema::apply_reader_pragmas;
use super::store::{self, Query};
use crate::error::Result;
use crate::setting::Setting;

/// Read connection pool for settings queries.
///
/// Provides pooled read-only connections for concurrent access.
#[derive(Clone)]
pub struct ReaderPool {
    pool: Pool<SqliteConnectionManager>,
}

impl ReaderPool {
    /// Create a new reader pool for the given database path.
    ///
    /// The database must already exist; open the writer side first.
    pub fn new<P: AsRef<Path>>(db_path: P, max_size: u32, busy_timeout: Duration) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);

        let pool = Pool::builder()
            .max_size(max_size)
            .connection_customizer(Box::new(ReaderConnectionCustomizer { busy_timeout }))
            .build(manager)?;

        Ok(Self { pool })
    }

    /// Get a connection from the pool.
    pub fn get(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Get the current pool state for monitoring.
    pub fn state(&self) -> r2d2::State {
        self.pool.state()
    }

    /// Run a query against the collection or a single row.
    pub fn select(&self, row_id: Option<i64>, query: &Query) -> Result<Vec<Setting>> {
        let conn = self.get()?;
        store::select(&conn, row_id, query)
    }
}

/// Connection customizer that applies reader pragmas.
#[derive(Debug)]
struct ReaderConnectionCustomizer {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error>
    for ReaderConnectionCustomizer
{
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
        apply_reader_pragmas(conn, self.busy_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setting::SettingValue;
    use crate::storage::schema::{apply_pragmas, initialize_schema};
    use rusqlite::Connection;
    use tempfile::TempDir;

    #[test]
    fn test_reader_pool_sees_committed_rows() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Create the database first with a write connection
        let writer = Connection::open(&db_path).unwrap();
        apply_pragmas(&writer, Duration::from_secs(1)).unwrap();
        initialize_schema(&writer).unwrap();
        store::insert(&writer, &Setting::new("theme", "dark")).unwrap();

        let pool = ReaderPool::new(&db_path, 5, Duration::from_secs(1)).unwrap();
        let rows = pool.select(None, &Query::by_key("theme")).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, SettingValue::String("dark".into()));
    }

    #[test]
    fn test_reader_connections_are_read_only() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        {
            let writer = Connection::open(&db_path).unwrap();
            apply_pragmas(&writer, Duration::from_secs(1)).unwrap();
            initialize_schema(&writer).unwrap();
        }

        let pool = ReaderPool::new(&db_path, 1, Duration::from_secs(1)).unwrap();
        let conn = pool.get().unwrap();
        assert!(store::insert(&conn, &Setting::new("k", 1i32)).is_err());
    }
}
