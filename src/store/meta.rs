//! Last-synced timestamps per entity table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{LocalStore, StoreError, Table};

impl LocalStore {
  /// When `table` was last refreshed from the remote, if ever.
  pub fn last_synced(&self, table: Table) -> Result<Option<DateTime<Utc>>, StoreError> {
    self.with_conn(|conn| {
      let millis: Option<i64> = conn
        .query_row(
          "SELECT last_synced FROM sync_meta WHERE table_name = ?",
          params![table.name()],
          |row| row.get(0),
        )
        .optional()?;
      Ok(millis.and_then(DateTime::from_timestamp_millis))
    })
  }

  pub fn set_last_synced(&self, table: Table, at: DateTime<Utc>) -> Result<(), StoreError> {
    self.with_conn(|conn| upsert_last_synced(conn, table, at))
  }
}

pub(super) fn upsert_last_synced(
  conn: &Connection,
  table: Table,
  at: DateTime<Utc>,
) -> Result<(), StoreError> {
  conn.execute(
    "INSERT INTO sync_meta (table_name, last_synced) VALUES (?1, ?2)
     ON CONFLICT(table_name) DO UPDATE SET last_synced = excluded.last_synced",
    params![table.name(), at.timestamp_millis()],
  )?;
  Ok(())
}
