//! SQLite storage layer for prefbox.
//!
//! Provides:
//! - Schema initialization and connection pragmas
//! - Row operations on the settings table
//! - Write transactions with batch coalescing and yield points
//! - Read connection pool for queries outside a transaction

pub mod reader;
pub mod schema;
pub mod store;
pub mod transaction;

use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Result;
use reader::ReaderPool;
use transaction::{open_writer_pool, WriterPool};

/// The opened database: one pool for writes, one for reads.
#[derive(Clone)]
pub struct Storage {
    path: PathBuf,
    writer: WriterPool,
    reader: ReaderPool,
}

impl Storage {
    /// Open (creating if needed) the database described by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.database_path();
        let busy_timeout = config.busy_timeout();

        // Switch to WAL and create the schema once, before any pool
        // connection exists.
        {
            let conn = Connection::open(&path)?;
            schema::apply_pragmas(&conn, busy_timeout)?;
            schema::initialize_schema(&conn)?;
        }

        let writer = open_writer_pool(&path, config.writer_pool_size, busy_timeout)?;
        let reader = ReaderPool::new(&path, config.reader_pool_size, busy_timeout)?;

        tracing::info!(path = %path.display(), "Storage opened");
        Ok(Self {
            path,
            writer,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writer(&self) -> &WriterPool {
        &self.writer
    }

    pub fn reader(&self) -> &ReaderPool {
        &self.reader
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("writer", &self.writer.state())
            .field("reader", &self.reader.state())
            .finish()
    }
}
