//! Durable FIFO of pending actions, plus the rejection side table and
//! dead-letter table used by the retry cutoff.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, warn};

use super::{LocalStore, StoreError};
use crate::queue::{PendingAction, QueuedAction};

/// A queued action that was given up on after repeated rejections.
#[derive(Debug, Clone)]
pub struct DeadLetter {
  pub item: QueuedAction,
  pub failed_at: DateTime<Utc>,
  pub last_error: Option<String>,
}

impl LocalStore {
  /// Append an action to the queue. Local-only; always succeeds unless the
  /// store itself is unavailable.
  pub fn enqueue_action(
    &self,
    action: &PendingAction,
    created_at: DateTime<Utc>,
  ) -> Result<QueuedAction, StoreError> {
    let payload = serde_json::to_string(action)?;

    self.with_conn(|conn| {
      conn.execute(
        "INSERT INTO sync_queue (action, payload, created_at) VALUES (?, ?, ?)",
        params![action.kind(), payload, created_at.timestamp_millis()],
      )?;
      let seq = conn.last_insert_rowid();
      debug!(seq, action = action.kind(), "queued action");

      Ok(QueuedAction {
        seq,
        action: action.clone(),
        created_at: from_millis(created_at.timestamp_millis()),
      })
    })
  }

  /// Queued actions with `seq > after`, oldest first.
  pub fn pending_actions_after(&self, after: i64) -> Result<Vec<QueuedAction>, StoreError> {
    self.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT seq, payload, created_at FROM sync_queue WHERE seq > ? ORDER BY seq",
      )?;
      let rows = stmt
        .query_map(params![after], raw_item)?
        .collect::<Result<Vec<_>, _>>()?;

      Ok(rows.into_iter().filter_map(decode_item).collect())
    })
  }

  /// Every queued action, oldest first.
  pub fn pending_actions(&self) -> Result<Vec<QueuedAction>, StoreError> {
    self.pending_actions_after(0)
  }

  /// Remove an item the remote has confirmed.
  pub fn complete_action(&self, seq: i64) -> Result<bool, StoreError> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      let removed = tx.execute("DELETE FROM sync_queue WHERE seq = ?", params![seq])?;
      tx.execute("DELETE FROM queue_rejections WHERE seq = ?", params![seq])?;
      tx.commit()?;
      Ok(removed > 0)
    })
  }

  /// Count one more rejection for `seq`, returning the new total.
  pub fn record_rejection(&self, seq: i64, error: &str) -> Result<u32, StoreError> {
    self.with_conn(|conn| {
      conn.execute(
        "INSERT INTO queue_rejections (seq, count, last_error) VALUES (?1, 1, ?2)
         ON CONFLICT(seq) DO UPDATE SET count = count + 1, last_error = excluded.last_error",
        params![seq, error],
      )?;
      let count: u32 = conn.query_row(
        "SELECT count FROM queue_rejections WHERE seq = ?",
        params![seq],
        |row| row.get(0),
      )?;
      Ok(count)
    })
  }

  /// Rejections recorded so far for `seq`.
  pub fn rejection_count(&self, seq: i64) -> Result<u32, StoreError> {
    self.with_conn(|conn| {
      let count: Option<u32> = conn
        .query_row(
          "SELECT count FROM queue_rejections WHERE seq = ?",
          params![seq],
          |row| row.get(0),
        )
        .optional()?;
      Ok(count.unwrap_or(0))
    })
  }

  /// Move an item out of the queue into the dead-letter table.
  pub fn dead_letter_action(&self, seq: i64, error: &str) -> Result<bool, StoreError> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      let moved = tx.execute(
        "INSERT OR REPLACE INTO dead_letters (seq, action, payload, created_at, failed_at, last_error)
         SELECT seq, action, payload, created_at, ?2, ?3 FROM sync_queue WHERE seq = ?1",
        params![seq, Utc::now().timestamp_millis(), error],
      )?;
      tx.execute("DELETE FROM sync_queue WHERE seq = ?", params![seq])?;
      tx.execute("DELETE FROM queue_rejections WHERE seq = ?", params![seq])?;
      tx.commit()?;
      Ok(moved > 0)
    })
  }

  /// Dead-lettered items, oldest first.
  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
    self.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT seq, payload, created_at, failed_at, last_error FROM dead_letters ORDER BY seq",
      )?;
      let rows = stmt
        .query_map([], |row| {
          Ok((
            raw_item(row)?,
            row.get::<_, i64>(3)?,
            row.get::<_, Option<String>>(4)?,
          ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

      Ok(
        rows
          .into_iter()
          .filter_map(|(raw, failed_at, last_error)| {
            decode_item(raw).map(|item| DeadLetter {
              item,
              failed_at: from_millis(failed_at),
              last_error,
            })
          })
          .collect(),
      )
    })
  }

  /// Number of items waiting in the queue.
  pub fn queue_len(&self) -> Result<usize, StoreError> {
    self.with_conn(|conn| {
      let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
      Ok(count as usize)
    })
  }

  /// Drop the queue, its rejection counts and the dead letters.
  pub fn clear_queue(&self) -> Result<usize, StoreError> {
    self.with_conn(|conn| {
      let tx = conn.transaction()?;
      let removed = tx.execute("DELETE FROM sync_queue", [])?;
      tx.execute("DELETE FROM queue_rejections", [])?;
      tx.execute("DELETE FROM dead_letters", [])?;
      tx.commit()?;
      Ok(removed)
    })
  }
}

type RawItem = (i64, String, i64);

fn raw_item(row: &Row<'_>) -> rusqlite::Result<RawItem> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode_item((seq, payload, created_at): RawItem) -> Option<QueuedAction> {
  match serde_json::from_str::<PendingAction>(&payload) {
    Ok(action) => Some(QueuedAction {
      seq,
      action,
      created_at: from_millis(created_at),
    }),
    Err(e) => {
      warn!(seq, error = %e, "skipping undecodable queued action");
      None
    }
  }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
