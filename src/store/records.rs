//! Entity table operations: get, get_all, put, bulk_put, delete, clear.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::meta::upsert_last_synced;
use super::{LocalStore, StoreError, Table};
use crate::cache::{Entity, EntityId, IndexField};

impl LocalStore {
  /// Look up one record by id.
  pub fn get<T: Entity>(&self, id: &EntityId) -> Result<Option<T>, StoreError> {
    self.with_conn(|conn| {
      let sql = format!("SELECT data FROM {} WHERE id = ?", T::TABLE.name());
      let data: Option<String> = conn
        .query_row(&sql, params![id.to_string()], |row| row.get(0))
        .optional()?;

      match data {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
      }
    })
  }

  /// All records of the table in insertion order.
  ///
  /// Overwriting a record keeps its original position. Rows that no longer
  /// decode (e.g. written by a newer build) are skipped.
  pub fn get_all<T: Entity>(&self) -> Result<Vec<T>, StoreError> {
    self.with_conn(|conn| {
      let sql = format!("SELECT id, data FROM {} ORDER BY rowid", T::TABLE.name());
      let mut stmt = conn.prepare(&sql)?;

      let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

      Ok(
        rows
          .into_iter()
          .filter_map(|(id, data)| match serde_json::from_str(&data) {
            Ok(record) => Some(record),
            Err(e) => {
              warn!(table = %T::TABLE, id = %id, error = %e, "skipping undecodable cached record");
              None
            }
          })
          .collect(),
      )
    })
  }

  /// Exact-match lookup on one of the indexed columns, in insertion order.
  pub fn find_by<T: Entity>(&self, field: IndexField, value: &str) -> Result<Vec<T>, StoreError> {
    self.with_conn(|conn| {
      let sql = format!(
        "SELECT data FROM {} WHERE {} = ? ORDER BY rowid",
        T::TABLE.name(),
        field.column()
      );
      let mut stmt = conn.prepare(&sql)?;

      let rows = stmt
        .query_map(params![value], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

      rows
        .iter()
        .map(|data| serde_json::from_str(data).map_err(StoreError::from))
        .collect()
    })
  }

  /// Insert or overwrite one record by id.
  pub fn put<T: Entity>(&self, record: &T) -> Result<(), StoreError> {
    self.with_conn(|conn| upsert(conn, record, Utc::now().timestamp_millis()))
  }

  /// Insert or overwrite many records as a single unit.
  ///
  /// Either every record is written or none is. Later entries win when the
  /// batch repeats an id.
  pub fn bulk_put<T: Entity>(&self, records: &[T]) -> Result<usize, StoreError> {
    self.with_conn(|conn| {
      let stored_at = Utc::now().timestamp_millis();
      let tx = conn.transaction()?;
      for record in records {
        upsert(&tx, record, stored_at)?;
      }
      tx.commit()?;

      debug!(table = %T::TABLE, count = records.len(), "bulk put");
      Ok(records.len())
    })
  }

  /// Merge a remote response into the table and stamp the table's
  /// last-synced time, as one transaction.
  ///
  /// Nothing is written when the store has moved on from `session` (a
  /// logout happened while the response was in flight); returns `false` then.
  pub fn merge_remote<T: Entity>(
    &self,
    records: &[T],
    session: u64,
    synced_at: DateTime<Utc>,
  ) -> Result<bool, StoreError> {
    self.with_conn(|conn| {
      if self.session() != session {
        debug!(table = %T::TABLE, session, "dropping response from an ended session");
        return Ok(false);
      }

      let tx = conn.transaction()?;
      for record in records {
        upsert(&tx, record, synced_at.timestamp_millis())?;
      }
      upsert_last_synced(&tx, T::TABLE, synced_at)?;
      tx.commit()?;
      Ok(true)
    })
  }

  /// Remove one record. Returns whether it existed.
  pub fn delete<T: Entity>(&self, id: &EntityId) -> Result<bool, StoreError> {
    self.with_conn(|conn| {
      let sql = format!("DELETE FROM {} WHERE id = ?", T::TABLE.name());
      let removed = conn.execute(&sql, params![id.to_string()])?;
      Ok(removed > 0)
    })
  }

  /// Remove every row of `table`. Indexes are maintained by SQLite, so no
  /// orphaned index entries remain.
  pub fn clear(&self, table: Table) -> Result<usize, StoreError> {
    self.with_conn(|conn| {
      let removed = conn.execute(&format!("DELETE FROM {}", table.name()), [])?;
      debug!(table = %table, removed, "cleared table");
      Ok(removed)
    })
  }

  /// Number of records in `table`.
  pub fn count(&self, table: Table) -> Result<usize, StoreError> {
    self.with_conn(|conn| {
      let count: i64 =
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name()), [], |row| row.get(0))?;
      Ok(count as usize)
    })
  }
}

fn upsert<T: Entity>(conn: &Connection, record: &T, stored_at: i64) -> Result<(), StoreError> {
  let data = serde_json::to_string(record)?;
  let index = record.index_values();

  let sql = format!(
    "INSERT INTO {} (id, name, mobile_number, status, data, stored_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
     ON CONFLICT(id) DO UPDATE SET
       name = excluded.name,
       mobile_number = excluded.mobile_number,
       status = excluded.status,
       data = excluded.data,
       stored_at = excluded.stored_at",
    T::TABLE.name()
  );

  conn.execute(
    &sql,
    params![
      record.id().to_string(),
      index.name,
      index.mobile_number,
      index.status,
      data,
      stored_at
    ],
  )?;
  Ok(())
}
