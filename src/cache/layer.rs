//! Cache layer that orchestrates cache-first loading with network refresh.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::recency::format_time_ago;
use super::traits::{CacheSource, Entity, LoadOutcome, SyncNotice};
use crate::api::RemoteApi;
use crate::network::NetworkMonitor;
use crate::store::{LocalStore, Table};

/// Everything a view needs to render one collection.
#[derive(Debug, Clone)]
pub struct SyncSnapshot<T> {
  pub records: Arc<Vec<T>>,
  /// True until the first load has produced data to show
  pub is_loading: bool,
  /// True while a network fetch for this table is in flight
  pub is_syncing: bool,
  /// The shown data comes from a load that could not reach the remote
  pub is_stale: bool,
  pub notice: Option<SyncNotice>,
  pub last_synced: Option<DateTime<Utc>>,
  /// Load sequence number that produced `records`
  pub revision: u64,
}

impl<T> SyncSnapshot<T> {
  pub fn last_synced_text(&self) -> String {
    format_time_ago(self.last_synced, Utc::now())
  }
}

#[derive(Clone)]
struct Fetched<T> {
  records: Arc<Vec<T>>,
  /// Set when the remote answered but the local store could not be updated
  cache_error: Option<String>,
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<Fetched<T>, SyncNotice>>>;

struct Inner<T: Entity> {
  store: Arc<LocalStore>,
  remote: Arc<dyn RemoteApi>,
  network: NetworkMonitor,
  endpoint: String,
  /// At most one remote fetch per table and store session; later callers
  /// attach to it
  inflight: Mutex<Option<(u64, SharedFetch<T>)>>,
  next_revision: AtomicU64,
  state: watch::Sender<SyncSnapshot<T>>,
}

/// Cache-first controller for one (remote endpoint, local table) pair.
///
/// Create one per table and clone it to share; clones share the in-flight
/// guard and the published snapshot.
pub struct CacheSync<T: Entity> {
  inner: Arc<Inner<T>>,
}

impl<T: Entity> Clone for CacheSync<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Entity> CacheSync<T> {
  pub fn new(
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApi>,
    network: NetworkMonitor,
    endpoint: impl Into<String>,
  ) -> Self {
    let last_synced = store.last_synced(T::TABLE).ok().flatten();
    let (state, _) = watch::channel(SyncSnapshot {
      records: Arc::new(Vec::new()),
      is_loading: true,
      is_syncing: false,
      is_stale: false,
      notice: None,
      last_synced,
      revision: 0,
    });

    Self {
      inner: Arc::new(Inner {
        store,
        remote,
        network,
        endpoint: endpoint.into(),
        inflight: Mutex::new(None),
        next_revision: AtomicU64::new(0),
        state,
      }),
    }
  }

  pub fn table(&self) -> Table {
    T::TABLE
  }

  pub fn endpoint(&self) -> &str {
    &self.inner.endpoint
  }

  /// Receive a new snapshot on every state change.
  pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot<T>> {
    self.inner.state.subscribe()
  }

  pub fn snapshot(&self) -> SyncSnapshot<T> {
    self.inner.state.borrow().clone()
  }

  /// Load the collection.
  ///
  /// 1. Unless `force_network`, a non-empty local table is returned as is
  /// 2. Otherwise, if online, fetch from the remote and merge into the table
  /// 3. If offline or the fetch fails, fall back to whatever is cached
  ///
  /// Never fails: problems are reported through [`LoadOutcome::notice`].
  pub async fn load(&self, force_network: bool) -> LoadOutcome<T> {
    let table = T::TABLE;
    let revision = self.inner.next_revision.fetch_add(1, Ordering::SeqCst) + 1;
    let session = self.inner.store.session();
    let mut notice = None;

    if !force_network {
      match self.inner.store.get_all::<T>() {
        Ok(cached) if !cached.is_empty() => {
          debug!(table = %table, count = cached.len(), "cache hit");
          return self.finish(session, revision, cached, CacheSource::Cache, None);
        }
        Ok(_) => {}
        Err(e) => {
          warn!(table = %table, error = %e, "local cache unavailable");
          notice = Some(SyncNotice::CacheUnavailable(e.to_string()));
        }
      }
    }

    if self.inner.network.is_online() {
      match self.fetch(session).await {
        Ok(fetched) => {
          let notice = fetched.cache_error.map(SyncNotice::CacheUnavailable);
          let records = fetched.records.as_ref().clone();
          return self.finish(session, revision, records, CacheSource::Network, notice);
        }
        Err(fetch_notice) => notice = Some(fetch_notice),
      }
    } else if force_network {
      info!(table = %table, "refresh requested while offline");
      notice = Some(SyncNotice::Offline);
    }

    let cached = match self.inner.store.get_all::<T>() {
      Ok(cached) => cached,
      Err(e) => {
        warn!(table = %table, error = %e, "local cache unavailable");
        notice = notice.or(Some(SyncNotice::CacheUnavailable(e.to_string())));
        Vec::new()
      }
    };
    self.finish(session, revision, cached, CacheSource::Stale, notice)
  }

  /// Bypass the cache; for pull-to-refresh and retry affordances.
  pub async fn refresh(&self) -> LoadOutcome<T> {
    self.load(true).await
  }

  /// Drop the published data (after logout).
  pub fn reset(&self) {
    let revision = self.inner.next_revision.fetch_add(1, Ordering::SeqCst) + 1;
    self.inner.state.send_modify(|s| {
      s.records = Arc::new(Vec::new());
      s.is_loading = true;
      s.is_stale = false;
      s.notice = None;
      s.last_synced = None;
      s.revision = revision;
    });
  }

  async fn fetch(&self, session: u64) -> Result<Fetched<T>, SyncNotice> {
    let fetch = self.shared_fetch(session);
    let result = fetch.clone().await;

    let mut slot = match self.inner.inflight.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    if slot.as_ref().is_some_and(|(_, f)| f.peek().is_some()) {
      *slot = None;
    }

    result
  }

  /// Join the running fetch for this table, or start one.
  ///
  /// The fetch runs as its own task, so the store write completes even if
  /// every caller stops waiting for it.
  fn shared_fetch(&self, session: u64) -> SharedFetch<T> {
    let mut slot = match self.inner.inflight.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    if let Some((fetch_session, existing)) = slot.as_ref() {
      if *fetch_session == session && existing.peek().is_none() {
        debug!(table = %T::TABLE, "joining in-flight fetch");
        return existing.clone();
      }
    }

    let inner = Arc::clone(&self.inner);
    inner.state.send_modify(|s| s.is_syncing = true);
    let task = tokio::spawn(async move {
      let result = inner.fetch_and_store(session).await;
      inner.state.send_modify(|s| s.is_syncing = false);
      result
    });

    let fetch = async move {
      task
        .await
        .unwrap_or_else(|e| Err(SyncNotice::FetchFailed(format!("fetch task failed: {}", e))))
    }
    .boxed()
    .shared();

    *slot = Some((session, fetch.clone()));
    fetch
  }

  fn finish(
    &self,
    session: u64,
    revision: u64,
    records: Vec<T>,
    source: CacheSource,
    notice: Option<SyncNotice>,
  ) -> LoadOutcome<T> {
    let last_synced = self.inner.store.last_synced(T::TABLE).unwrap_or_else(|e| {
      debug!(table = %T::TABLE, error = %e, "could not read last-synced time");
      None
    });

    let shown = Arc::new(records.clone());
    let shown_notice = notice.clone();
    let store = &self.inner.store;
    self.inner.state.send_if_modified(|s| {
      // Checked under the snapshot lock: `reset` after a logout either runs
      // later or already sees a newer session here.
      if store.session() != session {
        debug!(table = %T::TABLE, "discarding load from an ended session");
        return false;
      }
      // A network result always reflects the latest merge; anything else
      // must not replace data from a newer load.
      if source != CacheSource::Network && revision < s.revision {
        return false;
      }
      s.records = shown;
      s.is_loading = false;
      s.is_stale = source == CacheSource::Stale;
      s.notice = shown_notice;
      s.last_synced = last_synced;
      s.revision = s.revision.max(revision);
      true
    });

    LoadOutcome {
      records,
      source,
      notice,
      last_synced,
    }
  }
}

impl<T: Entity> Inner<T> {
  async fn fetch_and_store(&self, session: u64) -> Result<Fetched<T>, SyncNotice> {
    let table = T::TABLE;

    let items = self
      .remote
      .fetch_collection(&self.endpoint)
      .await
      .map_err(|e| {
        warn!(table = %table, error = %e, "remote fetch failed");
        SyncNotice::FetchFailed(e.to_string())
      })?;

    let fresh: Vec<T> = items
      .into_iter()
      .map(serde_json::from_value)
      .collect::<Result<_, _>>()
      .map_err(|e| {
        warn!(table = %table, error = %e, "malformed collection response");
        SyncNotice::FetchFailed(format!("malformed {} response: {}", table, e))
      })?;

    match self.store.merge_remote(&fresh, session, Utc::now()) {
      Ok(true) => {}
      Ok(false) => {
        info!(table = %table, "session ended during fetch, response discarded");
        return Err(SyncNotice::FetchFailed("session ended during sync".to_string()));
      }
      Err(e) => {
        warn!(table = %table, error = %e, "could not cache fetched records");
        return Ok(Fetched {
          records: Arc::new(fresh),
          cache_error: Some(e.to_string()),
        });
      }
    }

    info!(table = %table, count = fresh.len(), "refreshed from remote");

    // Additive merge: ids missing from the response stay cached
    match self.store.get_all::<T>() {
      Ok(merged) => Ok(Fetched {
        records: Arc::new(merged),
        cache_error: None,
      }),
      Err(e) => Ok(Fetched {
        records: Arc::new(fresh),
        cache_error: Some(e.to_string()),
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::fake::FakeRemote;
  use crate::api::types::Voter;
  use crate::network::NetworkStatus;
  use serde_json::json;
  use std::time::Duration;

  struct Harness {
    store: Arc<LocalStore>,
    remote: Arc<FakeRemote>,
    network: NetworkMonitor,
    voters: CacheSync<Voter>,
  }

  fn harness(status: NetworkStatus) -> Harness {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let remote = Arc::new(FakeRemote::new());
    let network = NetworkMonitor::new(status);
    let voters = CacheSync::new(
      Arc::clone(&store),
      remote.clone(),
      network.clone(),
      "/voters",
    );
    Harness {
      store,
      remote,
      network,
      voters,
    }
  }

  fn two_voters() -> Vec<serde_json::Value> {
    vec![
      json!({ "id": 1, "fullName": "A", "isVisited": false }),
      json!({ "id": 2, "fullName": "B", "isVisited": true }),
    ]
  }

  #[tokio::test]
  async fn test_empty_cache_fetches_and_stores() {
    let h = harness(NetworkStatus::Online);
    h.remote.set_collection("/voters", two_voters());
    let before = Utc::now();

    let outcome = h.voters.load(false).await;
    assert_eq!(outcome.source, CacheSource::Network);
    assert_eq!(outcome.records.len(), 2);

    let mut cached: Vec<Voter> = h.store.get_all().unwrap();
    cached.sort_by_key(|v| v.id);
    assert_eq!(cached[0].full_name, "A");
    assert!(cached[1].is_visited);
    assert_eq!(cached.len(), 2);

    let synced = h.store.last_synced(Table::Voters).unwrap().unwrap();
    assert!(synced.timestamp_millis() >= before.timestamp_millis());
    assert_eq!(outcome.last_synced, Some(synced));
  }

  #[tokio::test]
  async fn test_cache_hit_issues_no_remote_calls() {
    let h = harness(NetworkStatus::Online);
    h.store
      .bulk_put(&[Voter::sample(1, "A"), Voter::sample(2, "B"), Voter::sample(3, "C")])
      .unwrap();

    let first = h.voters.load(false).await;
    let second = h.voters.load(false).await;

    assert_eq!(first.source, CacheSource::Cache);
    assert_eq!(first.records, second.records);
    assert_eq!(second.records.len(), 3);
    assert_eq!(h.remote.fetch_calls(), 0);
  }

  #[tokio::test]
  async fn test_forced_refresh_offline_keeps_cached_records() {
    let h = harness(NetworkStatus::Offline);
    h.store
      .bulk_put(&[Voter::sample(1, "A"), Voter::sample(2, "B")])
      .unwrap();

    let outcome = h.voters.refresh().await;
    assert_eq!(outcome.records.len(), 2);
    assert!(outcome.is_stale());
    assert_eq!(outcome.notice, Some(SyncNotice::Offline));
    assert_eq!(h.remote.fetch_calls(), 0);

    let snapshot = h.voters.snapshot();
    assert!(snapshot.is_stale);
    assert_eq!(snapshot.notice, Some(SyncNotice::Offline));
  }

  #[tokio::test]
  async fn test_unforced_offline_load_is_quietly_stale() {
    let h = harness(NetworkStatus::Offline);

    let outcome = h.voters.load(false).await;
    assert!(outcome.records.is_empty());
    assert!(outcome.is_stale());
    assert_eq!(outcome.notice, None);
  }

  #[tokio::test]
  async fn test_failed_fetch_falls_back_to_cache() {
    let h = harness(NetworkStatus::Online);
    h.store.put(&Voter::sample(9, "Cached")).unwrap();
    h.remote.fail_collection("/voters");

    let outcome = h.voters.refresh().await;
    assert_eq!(outcome.records.len(), 1);
    assert!(outcome.is_stale());
    assert!(matches!(outcome.notice, Some(SyncNotice::FetchFailed(_))));
    assert_eq!(h.store.last_synced(Table::Voters).unwrap(), None);
  }

  #[tokio::test]
  async fn test_response_without_ids_is_rejected_whole() {
    let h = harness(NetworkStatus::Online);
    h.store.put(&Voter::sample(9, "Cached")).unwrap();
    h.remote.set_collection(
      "/voters",
      vec![json!({ "id": 1, "fullName": "A" }), json!({ "fullName": "no id" })],
    );

    let outcome = h.voters.refresh().await;
    assert!(outcome.is_stale());
    let cached: Vec<Voter> = h.store.get_all().unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, 9);
  }

  #[tokio::test]
  async fn test_refresh_does_not_delete_missing_ids() {
    let h = harness(NetworkStatus::Online);
    h.store
      .bulk_put(&[Voter::sample(1, "Old A"), Voter::sample(2, "Old B"), Voter::sample(3, "Ghost")])
      .unwrap();
    h.remote.set_collection("/voters", two_voters());

    let outcome = h.voters.refresh().await;
    assert_eq!(outcome.source, CacheSource::Network);

    let ids: Vec<i64> = outcome.records.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(outcome.records[0].full_name, "A");
    assert_eq!(outcome.records[2].full_name, "Ghost");
  }

  #[tokio::test]
  async fn test_concurrent_loads_share_one_fetch() {
    let h = harness(NetworkStatus::Online);
    h.remote.set_collection("/voters", two_voters());
    h.remote.set_fetch_delay(Duration::from_millis(50));

    let other = h.voters.clone();
    let (a, b) = tokio::join!(h.voters.refresh(), other.refresh());

    assert_eq!(h.remote.fetch_calls(), 1);
    assert_eq!(a.records.len(), 2);
    assert_eq!(b.records.len(), 2);

    // The guard is released afterwards
    h.voters.refresh().await;
    assert_eq!(h.remote.fetch_calls(), 2);
  }

  #[tokio::test]
  async fn test_abandoned_load_still_writes_cache() {
    let h = harness(NetworkStatus::Online);
    h.remote.set_collection("/voters", two_voters());
    h.remote.set_fetch_delay(Duration::from_millis(50));

    let abandoned = tokio::time::timeout(Duration::from_millis(5), h.voters.refresh()).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.store.count(Table::Voters).unwrap(), 2);

    // The abandoned caller's result was never published
    let snapshot = h.voters.snapshot();
    assert!(snapshot.records.is_empty());
    assert!(!snapshot.is_syncing);
  }

  #[tokio::test]
  async fn test_snapshot_is_published() {
    let h = harness(NetworkStatus::Online);
    h.remote.set_collection("/voters", two_voters());
    let mut rx = h.voters.subscribe();
    assert!(rx.borrow().is_loading);

    h.voters.load(false).await;

    assert!(rx.has_changed().unwrap());
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.records.len(), 2);
    assert!(!snapshot.is_loading);
    assert!(!snapshot.is_syncing);
    assert!(!snapshot.is_stale);
    assert_eq!(snapshot.last_synced_text(), "Just now");
  }

  #[tokio::test]
  async fn test_reconnect_then_refresh() {
    let h = harness(NetworkStatus::Offline);
    h.remote.set_collection("/voters", two_voters());

    assert!(h.voters.load(false).await.records.is_empty());
    h.network.set_status(NetworkStatus::Online);
    assert_eq!(h.voters.load(false).await.records.len(), 2);
  }

  #[tokio::test]
  async fn test_unavailable_cache_still_shows_fresh_data() {
    let h = harness(NetworkStatus::Online);
    h.remote.set_collection("/voters", two_voters());
    h.store.close().unwrap();

    let outcome = h.voters.load(false).await;
    assert_eq!(outcome.source, CacheSource::Network);
    assert_eq!(outcome.records.len(), 2);
    assert!(matches!(outcome.notice, Some(SyncNotice::CacheUnavailable(_))));
  }

  #[tokio::test]
  async fn test_fetch_in_flight_at_logout_does_not_repopulate() {
    let h = harness(NetworkStatus::Online);
    h.remote.set_collection("/voters", two_voters());
    h.remote.set_fetch_delay(Duration::from_millis(100));

    let voters = h.voters.clone();
    let pending = tokio::spawn(async move { voters.refresh().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.store.clear_session().unwrap();
    h.voters.reset();
    pending.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.store.count(Table::Voters).unwrap(), 0);
    assert_eq!(h.store.last_synced(Table::Voters).unwrap(), None);
    let snapshot = h.voters.snapshot();
    assert!(snapshot.records.is_empty());
    assert!(snapshot.last_synced.is_none());

    // The next session fetches afresh instead of joining the old request
    let outcome = h.voters.refresh().await;
    assert_eq!(outcome.source, CacheSource::Network);
    assert_eq!(h.store.count(Table::Voters).unwrap(), 2);
    assert_eq!(h.remote.fetch_calls(), 2);
  }

  #[tokio::test]
  async fn test_reset_clears_snapshot() {
    let h = harness(NetworkStatus::Online);
    h.remote.set_collection("/voters", two_voters());
    h.voters.load(false).await;

    h.voters.reset();
    let snapshot = h.voters.snapshot();
    assert!(snapshot.records.is_empty());
    assert_eq!(snapshot.last_synced_text(), "Never");
  }
}
