//! SQLite-backed storage shared by every pipeline worker.
//!
//! All coordination between workers goes through this database. Writers take
//! an immediate transaction so a read-validate-write sequence is never
//! interleaved with another writer, in this process or another one.

pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info};

pub use schema::{PartitionDdl, PartitionedTable, PARTITIONED_TABLES};

const SCHEMA_VERSION: i64 = 1;

/// Default wait for a competing writer before giving up
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database connection lock poisoned")]
    LockPoisoned,

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Database schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

/// Shared handle to the pipeline database
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file and apply migrations
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened database");

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        db.migrate()?;
        Ok(db)
    }

    /// File backing this database, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with exclusive use of the connection.
    ///
    /// Never call back into `Database` from inside `f`; the lock is not
    /// reentrant.
    pub fn with_conn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| E::from(StoreError::LockPoisoned))?;
        f(&mut guard)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at INTEGER NOT NULL
                );",
            )?;

            // Concurrent openers serialize here; the loser sees the new version
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: i64 = tx
                .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .optional()?
                .flatten()
                .unwrap_or(0);

            if current > SCHEMA_VERSION {
                return Err(StoreError::SchemaTooNew {
                    found: current,
                    supported: SCHEMA_VERSION,
                });
            }

            if current < 1 {
                tx.execute_batch(schema::BASE_SCHEMA)?;
                tx.execute(
                    "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                    params![1, "baseline_pipeline_tables", to_millis(Utc::now())],
                )?;
                info!(version = 1, "Applied schema migration");
            }
            tx.commit()?;

            Ok(())
        })
    }
}

/// Instants are stored as epoch milliseconds so comparisons stay numeric
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Quote an identifier after checking it is plain ASCII `[A-Za-z0-9_]`
pub fn quote_identifier(name: &str) -> Result<String, StoreError> {
    if schema::is_valid_identifier(name) {
        Ok(format!("\"{}\"", name))
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();

        let versions: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn test_open_file_database() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nested").join("pipeline.db");

        let db = Database::open(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));

        // Reopening sees the existing schema
        drop(db);
        Database::open(&path).unwrap();
    }

    #[test]
    fn test_millis_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        assert_eq!(from_millis(to_millis(ts)), ts);
    }

    #[test]
    fn test_quote_identifier_rejects_injection() {
        assert_eq!(quote_identifier("calls_p20261001").unwrap(), "\"calls_p20261001\"");
        assert!(quote_identifier("calls; DROP TABLE x").is_err());
        assert!(quote_identifier("").is_err());
        assert!(quote_identifier("a\"b").is_err());
    }
}
