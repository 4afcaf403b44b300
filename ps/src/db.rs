//! The `Store` handle: one SQLite connection behind a mutex, constructed
//! once at daemon startup and passed explicitly into every component.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::schema;

/// Typed store over the framework's relational model.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database at `path`, enable foreign keys,
    /// and apply the embedded schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        schema::init_schema(&conn)?;

        info!(path = %path.display(), "Opened store");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Internal("connection mutex poisoned".to_string()))
    }

    /// Run `f` inside a transaction: commit on Ok, rollback on Err.
    ///
    /// The state-machine transition, its ChangeHistory insert, and any
    /// lock-table mutation compose into a single atomic unit here.
    pub fn with_txn<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let txn = conn.transaction()?;
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Transaction rolls back on drop
                debug!(error = %e, "with_txn: rolling back");
                Err(e)
            }
        }
    }

    /// Read-only access without an explicit transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run pending migrations from `migrations_dir`.
    ///
    /// Refused while any task is IN_PROGRESS unless `force` is set:
    /// rewriting the schema under live workers is how data gets lost.
    pub fn run_migrations(&self, migrations_dir: &Path, force: bool) -> Result<Vec<String>> {
        let mut conn = self.lock()?;

        let in_progress: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'IN_PROGRESS'",
            [],
            |row| row.get(0),
        )?;
        if in_progress > 0 && !force {
            return Err(StoreError::MigrationBlocked(format!(
                "{} task(s) are IN_PROGRESS; stop the daemon or pass --force",
                in_progress
            )));
        }

        schema::run_migrations(&mut conn, migrations_dir)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

/// Current UTC timestamp in the ISO-8601 form used throughout the schema.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
