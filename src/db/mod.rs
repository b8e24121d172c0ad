//! Database module for Mailmirror
//!
//! SQLite storage for mirrored emails, queued label tasks and settings.
//! Label sets and reference lists live in JSON arrays so every
//! reconciliation step is a single set-difference `UPDATE ... RETURNING`.

mod emails;
mod labels;
mod tasks;
mod threads;

pub use emails::{BodyUpdate, Email, NewEmail};
pub use labels::{LabelChanges, LabelMembers};
pub use tasks::{Task, TaskAction, TaskRecord};
pub use threads::FallbackThreads;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if db_path.as_os_str() == ":memory:" {
            return Self::in_memory();
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(10))?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let conn = pool.get()?;

        // Performance PRAGMAs
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
        "#,
        )?;

        Self::init_schema(&conn)?;
        drop(conn);

        log::info!("Database opened at {:?}", db_path);
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled connection to `:memory:` would open its own empty
    /// database, so the pool is pinned to a single connection that never
    /// expires.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(std::time::Duration::from_secs(30))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn init_schema(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Self::run_migrations(conn)
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run migrations for existing databases
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1: tasks are retained as a log, so pending ones need a marker
        let has_processed_at: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('tasks') WHERE name = 'processed_at'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_processed_at {
            log::info!("Running migration: Adding processed_at column to tasks");
            conn.execute("ALTER TABLE tasks ADD COLUMN processed_at TEXT", [])?;
        }

        // Migration 2: header block kept for re-parsing without a refetch
        let has_header: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('emails') WHERE name = 'header'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_header {
            log::info!("Running migration: Adding header column to emails");
            conn.execute("ALTER TABLE emails ADD COLUMN header TEXT", [])?;
        }

        Ok(())
    }

    // =========================================================================
    // SEARCH INDEX
    // =========================================================================

    /// Rebuild the full-text index from the emails table
    pub fn refresh_search_index(&self) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO emails_search(emails_search) VALUES ('rebuild')",
            [],
        )?;
        Ok(())
    }

    /// Full-text search over subject, sender and text body
    pub fn search(&self, account: &str, query: &str, limit: i64) -> DbResult<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT e.id
            FROM emails_search
            JOIN emails e ON e.rowid = emails_search.rowid
            WHERE emails_search MATCH ?1 AND e.account = ?2
            ORDER BY emails_search.rank
            LIMIT ?3
            "#,
        )?;
        let ids = stmt
            .query_map(params![query, account, limit], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a JSON setting
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    /// Store a JSON setting
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, json],
        )?;
        Ok(())
    }
}

/// Read a JSON array column into a vector of strings
pub(crate) fn json_list(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) => serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(Vec::new()),
    }
}

/// Collect the ids produced by an `UPDATE ... RETURNING id` statement
pub(crate) fn returning_ids<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> DbResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}
