use relaycell_core::{Error, Result, StoreError};
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::messages::HistoryPolicy;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Map a rusqlite failure onto the typed store taxonomy.
pub(crate) fn store_err(context: &str, e: rusqlite::Error) -> Error {
    let msg = format!("{}: {}", context, e);
    let kind = match &e {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Busy(msg),
            ErrorCode::ConstraintViolation => StoreError::Constraint(msg),
            ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::CannotOpen
            | ErrorCode::ReadOnly
            | ErrorCode::PermissionDenied => StoreError::Io(msg),
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StoreError::Corrupt(msg),
            _ => StoreError::Schema(msg),
        },
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(msg),
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(msg),
        _ => StoreError::Schema(msg),
    };
    Error::Store(kind)
}

/// SQLite-backed store for agents, messages and tasks.
///
/// All handles share one connection behind a mutex. Counter mutations on a
/// task row additionally run inside `BEGIN EXCLUSIVE`, which also serializes
/// them against other processes opening the same database file.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
    pub(crate) policy: HistoryPolicy,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Store(StoreError::Io(format!("Failed to create db directory: {}", e)))
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| store_err("Failed to open db", e))?;

        // WAL lets readers proceed while a counter transaction holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let store = Self::from_connection(conn, Some(db_path.to_path_buf()))?;
        info!(path = %db_path.display(), "Store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| store_err("Failed to open db", e))?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| store_err("Failed to set busy timeout", e))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| store_err("Failed to enable foreign keys", e))?;

        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path,
            policy: HistoryPolicy::default(),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Replace the observation-masking policy used by `history_for`.
    pub fn with_history_policy(mut self, policy: HistoryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn history_policy(&self) -> &HistoryPolicy {
        &self.policy
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Store(StoreError::Io(format!("Lock error: {}", e))))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL DEFAULT 'ai_agent'
                    CHECK (kind IN ('human', 'ai_agent', 'system')),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_agent_id INTEGER NOT NULL REFERENCES agents(id),
                to_agent_id INTEGER NOT NULL REFERENCES agents(id),
                content TEXT NOT NULL,
                tool_calls TEXT,
                channel TEXT NOT NULL DEFAULT 'internal',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages(from_agent_id, to_agent_id, id);

            -- parent_task_id carries no foreign key: parents are deleted on
            -- completion while their children may still be referenced
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                requester TEXT NOT NULL,
                requester_channel TEXT NOT NULL,
                context_id TEXT NOT NULL DEFAULT 'default',
                original_request TEXT NOT NULL,
                delegated_to TEXT NOT NULL,
                delegation_context TEXT NOT NULL DEFAULT '{\"delegations\":[]}',
                parent_task_id TEXT,
                pending_delegations INTEGER NOT NULL DEFAULT 0
                    CHECK (pending_delegations >= 0),
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'cancelled')),
                result TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_delegated ON tasks(delegated_to);
            ",
        )
        .map_err(|e| store_err("Failed to init schema", e))?;

        debug!("Store schema initialized");
        Ok(())
    }
}
