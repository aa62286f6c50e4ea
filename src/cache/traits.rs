//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

use crate::store::Table;

/// Stable identifier of a cached entity. The remote hands out numeric ids for
/// some tables and string ids for others.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
  Num(i64),
  Text(String),
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EntityId::Num(n) => fmt::Display::fmt(n, f),
      EntityId::Text(s) => f.pad(s),
    }
  }
}

impl From<i64> for EntityId {
  fn from(n: i64) -> Self {
    EntityId::Num(n)
  }
}

impl From<&str> for EntityId {
  fn from(s: &str) -> Self {
    EntityId::Text(s.to_string())
  }
}

impl From<String> for EntityId {
  fn from(s: String) -> Self {
    EntityId::Text(s)
  }
}

/// Searchable columns kept beside each cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexField {
  Name,
  MobileNumber,
  Status,
}

impl IndexField {
  pub(crate) fn column(self) -> &'static str {
    match self {
      IndexField::Name => "name",
      IndexField::MobileNumber => "mobile_number",
      IndexField::Status => "status",
    }
  }
}

/// Values an entity contributes to the secondary indexes.
#[derive(Debug, Default)]
pub struct IndexValues<'a> {
  pub name: Option<&'a str>,
  pub mobile_number: Option<&'a str>,
  pub status: Option<String>,
}

/// Trait for entities that can be cached.
///
/// Records are denormalized snapshots: everything a view needs is in the
/// record itself, so no secondary lookups happen on render.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Table the entity lives in.
  const TABLE: Table;

  /// Unique identifier within the table.
  fn id(&self) -> EntityId;

  fn index_values(&self) -> IndexValues<'_> {
    IndexValues::default()
  }
}

/// Indicates where loaded data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Served from the local store without touching the network
  Cache,
  /// Fresh data from the remote, merged into the local store
  Network,
  /// Network skipped or failed; serving whatever the local store has
  Stale,
}

/// Something the user should be told about a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
  /// A forced refresh was requested while offline
  Offline,
  /// The remote fetch failed; cached data is shown instead
  FetchFailed(String),
  /// The local store could not be read or written
  CacheUnavailable(String),
}

impl fmt::Display for SyncNotice {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SyncNotice::Offline => f.write_str("You are offline. Cannot sync right now."),
      SyncNotice::FetchFailed(e) => write!(f, "Could not sync: {}", e),
      SyncNotice::CacheUnavailable(e) => write!(f, "Offline cache unavailable: {}", e),
    }
  }
}

/// Result of one load, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct LoadOutcome<T> {
  pub records: Vec<T>,
  pub source: CacheSource,
  pub notice: Option<SyncNotice>,
  pub last_synced: Option<DateTime<Utc>>,
}

impl<T> LoadOutcome<T> {
  /// Whether the data may be behind the remote because a sync did not happen.
  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::Stale
  }
}
