//! Durable local store for cached entities and the pending-action queue.
//!
//! Everything lives in one SQLite file:
//! - one table per entity type (tenants, voters, workers), keyed by entity id
//!   and indexed on the fields the views search by
//! - a FIFO queue of deferred mutations keyed by an auto-increment sequence id
//! - a small key-value area with the last successful refresh per table
//!
//! The schema is versioned through `PRAGMA user_version`; see [`schema`].

mod meta;
mod queue;
mod records;
mod schema;

use rusqlite::{Connection, ErrorCode};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

pub use queue::DeadLetter;
pub use schema::LATEST_VERSION;

/// Entity tables managed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
  Tenants,
  Voters,
  Workers,
}

impl Table {
  pub const ALL: [Table; 3] = [Table::Tenants, Table::Voters, Table::Workers];

  /// SQL table name. Only these static names are ever interpolated into SQL.
  pub fn name(self) -> &'static str {
    match self {
      Table::Tenants => "tenants",
      Table::Voters => "voters",
      Table::Workers => "workers",
    }
  }
}

impl fmt::Display for Table {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.name())
  }
}

impl FromStr for Table {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "tenants" | "tenant" => Ok(Table::Tenants),
      "voters" | "voter" => Ok(Table::Voters),
      "workers" | "worker" => Ok(Table::Workers),
      other => Err(format!(
        "unknown table '{}' (expected tenants, voters or workers)",
        other
      )),
    }
  }
}

/// Errors raised by the local store.
///
/// Every variant except [`StoreError::Encoding`] means the cache itself cannot
/// be used right now; callers treat those as "cache unavailable", never as
/// "entity absent".
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("local storage is full")]
  QuotaExceeded(#[source] rusqlite::Error),
  #[error("local cache is corrupt")]
  Corrupt(#[source] rusqlite::Error),
  #[error("local cache unavailable: {0}")]
  Unavailable(String),
  #[error("local cache has been closed")]
  Closed,
  #[error("migration to schema version {version} failed")]
  Migration {
    version: u32,
    #[source]
    source: rusqlite::Error,
  },
  #[error("failed to encode or decode cached record: {0}")]
  Encoding(#[from] serde_json::Error),
  #[error("local cache query failed: {0}")]
  Sqlite(#[source] rusqlite::Error),
}

impl StoreError {
  /// Whether this error means the cache as a whole is unusable.
  pub fn is_cache_unavailable(&self) -> bool {
    !matches!(self, StoreError::Encoding(_))
  }
}

impl From<rusqlite::Error> for StoreError {
  fn from(err: rusqlite::Error) -> Self {
    match err.sqlite_error_code() {
      Some(ErrorCode::DiskFull) => StoreError::QuotaExceeded(err),
      Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => StoreError::Corrupt(err),
      Some(
        ErrorCode::CannotOpen
        | ErrorCode::DatabaseBusy
        | ErrorCode::DatabaseLocked
        | ErrorCode::ReadOnly
        | ErrorCode::SystemIoFailure
        | ErrorCode::PermissionDenied,
      ) => StoreError::Unavailable(err.to_string()),
      _ => StoreError::Sqlite(err),
    }
  }
}

/// Handle to the on-device database.
///
/// Construct one per process with [`LocalStore::open`], share it behind an
/// `Arc`, and call [`LocalStore::close`] on shutdown. Each public operation
/// takes the connection lock once, so every `put`/`bulk_put`/`delete`/`clear`
/// is atomic with respect to the others.
pub struct LocalStore {
  conn: Mutex<Option<Connection>>,
  /// Bumped by [`LocalStore::clear_session`]; only changed under the
  /// connection lock
  session: AtomicU64,
}

impl LocalStore {
  /// Open (creating if needed) the store at `path` and migrate it to the
  /// latest schema version.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Unavailable(format!(
          "failed to create cache directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    info!(path = %path.display(), "opened local store");
    Self::from_connection(conn, LATEST_VERSION)
  }

  /// Open a throwaway in-memory store. Used by tests and dry runs.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::from_connection(Connection::open_in_memory()?, LATEST_VERSION)
  }

  fn from_connection(conn: Connection, target_version: u32) -> Result<Self, StoreError> {
    // In-memory databases stay in "memory" mode; anything else is reported
    // by the first real query below.
    match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
      Ok(mode) => debug!(mode = %mode, "journal mode"),
      Err(e) => debug!(error = %e, "could not enable WAL journal"),
    }

    let store = Self::unmigrated(conn);
    store.migrate_to(target_version)?;
    Ok(store)
  }

  fn unmigrated(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(Some(conn)),
      session: AtomicU64::new(0),
    }
  }

  /// Current session number. Writes of remote data tagged with an older
  /// session are dropped.
  pub fn session(&self) -> u64 {
    self.session.load(Ordering::SeqCst)
  }

  /// Wipe every entity table, the queue (with its rejection counts and dead
  /// letters) and the sync metadata in one transaction, then start a new
  /// session. Returns the number of queued actions discarded.
  pub fn clear_session(&self) -> Result<usize, StoreError> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      for table in Table::ALL {
        tx.execute(&format!("DELETE FROM {}", table.name()), [])?;
      }
      let discarded = tx.execute("DELETE FROM sync_queue", [])?;
      tx.execute("DELETE FROM queue_rejections", [])?;
      tx.execute("DELETE FROM dead_letters", [])?;
      tx.execute("DELETE FROM sync_meta", [])?;
      tx.commit()?;

      let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
      info!(session, discarded, "cleared local session data");
      Ok(discarded)
    })
  }

  /// Bring the schema up to `target_version`, applying each pending migration
  /// in its own transaction. Existing rows are never touched.
  pub(crate) fn migrate_to(&self, target_version: u32) -> Result<u32, StoreError> {
    self.with_conn(|conn| schema::migrate(conn, target_version))
  }

  /// Current schema version of the underlying file.
  pub fn schema_version(&self) -> Result<u32, StoreError> {
    self.with_conn(|conn| schema::current_version(conn))
  }

  /// Close the underlying connection. Later operations fail with
  /// [`StoreError::Closed`].
  pub fn close(&self) -> Result<(), StoreError> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))?;

    match guard.take() {
      Some(conn) => {
        conn.close().map_err(|(_, e)| StoreError::from(e))?;
        info!("closed local store");
        Ok(())
      }
      None => Ok(()),
    }
  }

  /// Run `f` with exclusive access to the open connection.
  pub(crate) fn with_conn<R>(
    &self,
    f: impl FnOnce(&mut Connection) -> Result<R, StoreError>,
  ) -> Result<R, StoreError> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))?;
    let conn = guard.as_mut().ok_or(StoreError::Closed)?;
    f(conn)
  }
}
