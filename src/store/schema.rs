//! Versioned schema for the local store.
//!
//! Each entry in [`MIGRATIONS`] moves the file from `version - 1` to
//! `version`. Migrations only ever add tables and indexes, so rows in
//! unaffected tables survive every upgrade.

use rusqlite::Connection;
use tracing::info;

use super::StoreError;

struct Migration {
  version: u32,
  sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    sql: r#"
-- Cached voter snapshots (serialized JSON plus searchable columns)
CREATE TABLE IF NOT EXISTS voters (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT,
    mobile_number TEXT,
    status TEXT,
    data TEXT NOT NULL,
    stored_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_voters_name ON voters(name);
CREATE INDEX IF NOT EXISTS idx_voters_status ON voters(status);

-- Deferred mutations, replayed in seq order
CREATE TABLE IF NOT EXISTS sync_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_action ON sync_queue(action);
CREATE INDEX IF NOT EXISTS idx_sync_queue_created ON sync_queue(created_at);
"#,
  },
  Migration {
    version: 2,
    sql: r#"
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT,
    mobile_number TEXT,
    status TEXT,
    data TEXT NOT NULL,
    stored_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tenants_name ON tenants(name);
CREATE INDEX IF NOT EXISTS idx_tenants_status ON tenants(status);

CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT,
    mobile_number TEXT,
    status TEXT,
    data TEXT NOT NULL,
    stored_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workers_name ON workers(name);
CREATE INDEX IF NOT EXISTS idx_workers_mobile ON workers(mobile_number);
CREATE INDEX IF NOT EXISTS idx_workers_status ON workers(status);

CREATE INDEX IF NOT EXISTS idx_voters_mobile ON voters(mobile_number);
"#,
  },
  Migration {
    version: 3,
    sql: r#"
-- Last successful remote refresh per entity table
CREATE TABLE IF NOT EXISTS sync_meta (
    table_name TEXT PRIMARY KEY NOT NULL,
    last_synced INTEGER NOT NULL
);

-- Rejection counts kept beside the queue so queued items stay immutable
CREATE TABLE IF NOT EXISTS queue_rejections (
    seq INTEGER PRIMARY KEY NOT NULL,
    count INTEGER NOT NULL,
    last_error TEXT
);

-- Items the remote rejected too many times
CREATE TABLE IF NOT EXISTS dead_letters (
    seq INTEGER PRIMARY KEY NOT NULL,
    action TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    failed_at INTEGER NOT NULL,
    last_error TEXT
);
"#,
  },
];

/// Newest schema version this build knows about.
pub const LATEST_VERSION: u32 = 3;

pub(super) fn current_version(conn: &Connection) -> Result<u32, StoreError> {
  let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
  Ok(version)
}

/// Apply every migration above the file's current version, up to `target`.
/// Returns the resulting version.
pub(super) fn migrate(conn: &mut Connection, target: u32) -> Result<u32, StoreError> {
  let start = current_version(conn)?;
  let mut version = start;

  for migration in MIGRATIONS
    .iter()
    .filter(|m| m.version > start && m.version <= target)
  {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)
      .and_then(|_| tx.pragma_update(None, "user_version", migration.version))
      .map_err(|source| StoreError::Migration {
        version: migration.version,
        source,
      })?;
    tx.commit()?;

    info!(version = migration.version, "applied local store migration");
    version = migration.version;
  }

  Ok(version)
}
