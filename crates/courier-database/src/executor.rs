//! Async access to the Courier SQLite file through one executor thread.
//!
//! All SQL for one `AsyncDatabase` runs on a single thread owned by
//! `tokio-rusqlite`. Callers send closures through a channel and await the
//! result, so the Tokio runtime is never blocked by SQLite.
//!
//! Only SQL and light row mapping belong inside `call()`. Payload decoding,
//! dispatch and backoff math happen outside, after the result is returned.
//!
//! # Example
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let item = db.call(move |conn| queries::claim_next_due(conn, now)).await?;
//! ```

use crate::{functions, migrations, DatabaseError, DatabaseResult};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

/// Map executor failures onto `DatabaseError`.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("Connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// Handle to the outbox and idempotency tables.
///
/// Cloning shares the same executor thread. Separate processes (or tests
/// simulating them) open separate instances on the same file.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open (or create) the database file at `path`.
    ///
    /// Missing parent directories are created. The connection runs in WAL mode
    /// with a busy timeout so several processes can claim from the same file,
    /// and has `REGEXP` registered and all migrations applied before it is
    /// returned.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening courier database");

        let conn = Connection::open(&path_str)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            conn,
            path: path_str,
        };
        db.initialize(PRAGMAS).await?;

        info!(path = %db.path, "Async database initialized with WAL mode");
        Ok(db)
    }

    /// Open a private in-memory database. Used by tests and dry runs.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self {
            conn,
            path: ":memory:".to_string(),
        };
        db.initialize("PRAGMA foreign_keys = ON;").await?;
        debug!("In-memory database initialized");
        Ok(db)
    }

    async fn initialize(&self, pragmas: &'static str) -> DatabaseResult<()> {
        self.call(move |conn| {
            conn.execute_batch(pragmas)?;
            functions::register_functions(conn)?;
            migrations::run_migrations(conn)
        })
        .await
    }

    /// Run `f` on the executor thread and await its result.
    ///
    /// Calls on one handle (and its clones) run strictly in order. Keep `f`
    /// to SQL and row mapping; slow work here delays every other query.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // The inner DatabaseResult rides inside tokio_rusqlite's Ok variant so
        // our own error type survives the channel.
        let outer_result = self.conn.call(move |conn| Ok(f(conn))).await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Like [`call`](Self::call) for closures returning `rusqlite::Result`.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// File path, or `:memory:`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Round-trip a trivial query through the executor.
    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1")).await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Shut down the executor thread once queued calls have run.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("close failed: {e:?}")))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}
