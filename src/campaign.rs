//! One session's worth of sync machinery, wired together.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::{HttpApi, RemoteApi, Tenant, Voter, Worker};
use crate::cache::{CacheSource, CacheSync, LoadOutcome, SyncNotice};
use crate::config::{Config, EndpointsConfig, QueueConfig};
use crate::network::{self, NetworkMonitor, NetworkStatus};
use crate::queue::{PendingAction, QueueProcessor, Submission};
use crate::store::{LocalStore, StoreError, Table};

/// Result of loading one table, without the records themselves.
#[derive(Debug, Clone)]
pub struct PullSummary {
  pub table: Table,
  pub count: usize,
  pub source: CacheSource,
  pub notice: Option<SyncNotice>,
  pub last_synced: Option<DateTime<Utc>>,
}

impl PullSummary {
  fn from_outcome<T>(table: Table, outcome: &LoadOutcome<T>) -> Self {
    Self {
      table,
      count: outcome.records.len(),
      source: outcome.source,
      notice: outcome.notice.clone(),
      last_synced: outcome.last_synced,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TableStatus {
  pub table: Table,
  pub cached: usize,
  pub last_synced: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
  pub network: NetworkStatus,
  pub tables: Vec<TableStatus>,
  pub pending: usize,
  pub dead_letters: usize,
}

pub struct CampaignSync {
  store: Arc<LocalStore>,
  remote: Arc<dyn RemoteApi>,
  network: NetworkMonitor,
  tenants: CacheSync<Tenant>,
  voters: CacheSync<Voter>,
  workers: CacheSync<Worker>,
  queue: QueueProcessor,
}

impl CampaignSync {
  pub fn new(
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApi>,
    network: NetworkMonitor,
    endpoints: &EndpointsConfig,
    queue_config: &QueueConfig,
  ) -> Self {
    let tenants = CacheSync::new(
      Arc::clone(&store),
      Arc::clone(&remote),
      network.clone(),
      endpoints.tenants.as_str(),
    );
    let voters = CacheSync::new(
      Arc::clone(&store),
      Arc::clone(&remote),
      network.clone(),
      endpoints.voters.as_str(),
    );
    let workers = CacheSync::new(
      Arc::clone(&store),
      Arc::clone(&remote),
      network.clone(),
      endpoints.workers.as_str(),
    );
    let queue = QueueProcessor::new(
      Arc::clone(&store),
      Arc::clone(&remote),
      network.clone(),
      queue_config.max_rejections,
    );
    queue.set_defer_same_entity(queue_config.defer_same_entity);

    Self {
      store,
      remote,
      network,
      tenants,
      voters,
      workers,
      queue,
    }
  }

  /// Open the configured store and HTTP client. Connectivity starts out
  /// `Offline` until [`probe`](Self::probe) says otherwise.
  pub fn from_config(config: &Config) -> Result<Self> {
    let path = config.store.resolved_path()?;
    let store = Arc::new(LocalStore::open(&path)?);
    let remote: Arc<dyn RemoteApi> = Arc::new(HttpApi::new(&config.api, Config::get_api_token())?);
    info!(store = %path.display(), api = %config.api.base_url, "sync session opened");

    Ok(Self::new(
      store,
      remote,
      NetworkMonitor::new(NetworkStatus::Offline),
      &config.api.endpoints,
      &config.queue,
    ))
  }

  pub fn store(&self) -> &Arc<LocalStore> {
    &self.store
  }

  pub fn network(&self) -> &NetworkMonitor {
    &self.network
  }

  pub fn tenants(&self) -> &CacheSync<Tenant> {
    &self.tenants
  }

  pub fn voters(&self) -> &CacheSync<Voter> {
    &self.voters
  }

  pub fn workers(&self) -> &CacheSync<Worker> {
    &self.workers
  }

  pub fn queue(&self) -> &QueueProcessor {
    &self.queue
  }

  pub async fn probe(&self) -> NetworkStatus {
    network::probe_once(&self.network, self.remote.as_ref()).await
  }

  /// Keep connectivity fresh and drain the queue whenever it comes back.
  pub fn spawn_background(&self, probe_interval: Duration) -> Vec<JoinHandle<()>> {
    vec![
      network::spawn_probe(self.network.clone(), Arc::clone(&self.remote), probe_interval),
      self.queue.spawn_auto_drain(),
    ]
  }

  pub async fn pull(&self, table: Table, force_network: bool) -> PullSummary {
    match table {
      Table::Tenants => PullSummary::from_outcome(table, &self.tenants.load(force_network).await),
      Table::Voters => PullSummary::from_outcome(table, &self.voters.load(force_network).await),
      Table::Workers => PullSummary::from_outcome(table, &self.workers.load(force_network).await),
    }
  }

  /// Queue a mutation and re-publish the affected collection so views see
  /// the optimistic change right away.
  ///
  /// When online the queue is drained, inline if `wait_for_drain` is set.
  pub async fn submit(
    &self,
    action: PendingAction,
    wait_for_drain: bool,
  ) -> Result<Submission, StoreError> {
    let submission = self.queue.submit(action, wait_for_drain).await?;
    let (table, _) = submission.item.action.target();
    self.reload_cached(table).await;
    Ok(submission)
  }

  async fn reload_cached(&self, table: Table) {
    if self.store.count(table).unwrap_or(0) == 0 {
      return;
    }
    match table {
      Table::Tenants => {
        self.tenants.load(false).await;
      }
      Table::Voters => {
        self.voters.load(false).await;
      }
      Table::Workers => {
        self.workers.load(false).await;
      }
    }
  }

  pub fn status(&self) -> Result<StatusReport, StoreError> {
    let mut tables = Vec::with_capacity(Table::ALL.len());
    for table in Table::ALL {
      tables.push(TableStatus {
        table,
        cached: self.store.count(table)?,
        last_synced: self.store.last_synced(table)?,
      });
    }

    Ok(StatusReport {
      network: self.network.current_status(),
      tables,
      pending: self.store.queue_len()?,
      dead_letters: self.store.dead_letters()?.len(),
    })
  }

  /// Wipe every cached record, queued action and sync timestamp.
  ///
  /// Unsynced actions are discarded; the store holds data for one
  /// authenticated session at a time.
  ///
  /// Fetches and drains still running for the old session finish without
  /// writing to the store or publishing to the snapshots.
  pub fn logout(&self) -> Result<(), StoreError> {
    let pending = self.store.clear_session()?;
    self.queue.clear()?;

    self.tenants.reset();
    self.voters.reset();
    self.workers.reset();
    info!(discarded_actions = pending, "local data cleared");
    Ok(())
  }

  pub fn close(&self) -> Result<(), StoreError> {
    self.store.close()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::fake::FakeRemote;
  use crate::cache::EntityId;
  use crate::queue::SupportLevel;
  use serde_json::json;

  fn session(status: NetworkStatus) -> (CampaignSync, Arc<FakeRemote>) {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let remote = Arc::new(FakeRemote::new());
    remote.set_collection(
      "/voters",
      vec![json!({ "id": 1, "fullName": "A" }), json!({ "id": 2, "fullName": "B" })],
    );
    remote.set_collection("/tenants", vec![json!({ "id": 10, "candidateName": "C", "status": true })]);
    let sync = CampaignSync::new(
      store,
      remote.clone(),
      NetworkMonitor::new(status),
      &EndpointsConfig::default(),
      &QueueConfig::default(),
    );
    (sync, remote)
  }

  #[tokio::test]
  async fn test_pull_reports_source() {
    let (sync, remote) = session(NetworkStatus::Online);

    let first = sync.pull(Table::Voters, false).await;
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.count, 2);

    let second = sync.pull(Table::Voters, false).await;
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(remote.fetch_calls(), 1);
  }

  #[tokio::test]
  async fn test_offline_submit_patches_cache_and_snapshot() {
    let (sync, remote) = session(NetworkStatus::Online);
    sync.pull(Table::Voters, false).await;
    sync.network().set_status(NetworkStatus::Offline);

    let submission = sync
      .submit(
        PendingAction::UpdateVoterStatus {
          voter_id: 1,
          status: SupportLevel::Favorable,
        },
        true,
      )
      .await
      .unwrap();
    assert_eq!(submission.item.seq, 1);
    assert!(submission.drained.is_none());
    assert!(remote.replayed().is_empty());

    let voter: Voter = sync.store().get(&EntityId::Num(1)).unwrap().unwrap();
    assert_eq!(voter.support_level, "FAVORABLE");

    let snapshot = sync.voters().snapshot();
    let shown = snapshot.records.iter().find(|v| v.id == 1).unwrap();
    assert_eq!(shown.support_level, "FAVORABLE");
    assert!(shown.is_visited);
  }

  #[tokio::test]
  async fn test_status_report() {
    let (sync, _remote) = session(NetworkStatus::Online);
    sync.pull(Table::Tenants, false).await;
    sync
      .queue()
      .enqueue(PendingAction::MarkVoted {
        voter_id: 5,
        has_voted: true,
      })
      .unwrap();

    let report = sync.status().unwrap();
    assert_eq!(report.network, NetworkStatus::Online);
    assert_eq!(report.pending, 1);
    assert_eq!(report.dead_letters, 0);
    let tenants = report.tables.iter().find(|t| t.table == Table::Tenants).unwrap();
    assert_eq!(tenants.cached, 1);
    assert!(tenants.last_synced.is_some());
    let workers = report.tables.iter().find(|t| t.table == Table::Workers).unwrap();
    assert_eq!(workers.cached, 0);
    assert!(workers.last_synced.is_none());
  }

  #[tokio::test]
  async fn test_logout_clears_everything() {
    let (sync, _remote) = session(NetworkStatus::Online);
    sync.pull(Table::Voters, false).await;
    sync.pull(Table::Tenants, false).await;
    sync.network().set_status(NetworkStatus::Offline);
    sync
      .queue()
      .enqueue(PendingAction::SetTenantStatus {
        tenant_id: 10,
        active: false,
      })
      .unwrap();

    sync.logout().unwrap();

    for table in Table::ALL {
      assert_eq!(sync.store().count(table).unwrap(), 0);
      assert_eq!(sync.store().last_synced(table).unwrap(), None);
    }
    assert_eq!(sync.store().queue_len().unwrap(), 0);
    assert!(sync.voters().snapshot().records.is_empty());
    let gone: Option<Tenant> = sync.store().get(&EntityId::Num(10)).unwrap();
    assert!(gone.is_none());
  }

  #[tokio::test]
  async fn test_online_submit_waits_for_replay() {
    let (sync, remote) = session(NetworkStatus::Online);
    sync.pull(Table::Voters, false).await;

    let submission = sync
      .submit(
        PendingAction::MarkVoted {
          voter_id: 2,
          has_voted: true,
        },
        true,
      )
      .await
      .unwrap();

    assert_eq!(submission.drained.map(|r| r.committed), Some(1));
    assert_eq!(remote.replayed().len(), 1);
    assert_eq!(sync.store().queue_len().unwrap(), 0);
    let shown = sync.voters().snapshot();
    assert!(shown.records.iter().any(|v| v.id == 2 && v.has_voted));
  }

  #[tokio::test]
  async fn test_logout_during_fetch_leaves_store_empty() {
    let (sync, remote) = session(NetworkStatus::Online);
    remote.set_fetch_delay(Duration::from_millis(100));

    let voters = sync.voters().clone();
    let pending = tokio::spawn(async move { voters.refresh().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    sync.logout().unwrap();
    pending.await.unwrap();

    assert_eq!(sync.store().count(Table::Voters).unwrap(), 0);
    assert_eq!(sync.store().last_synced(Table::Voters).unwrap(), None);
    let snapshot = sync.voters().snapshot();
    assert!(snapshot.records.is_empty());
    assert!(snapshot.is_loading);
    assert!(snapshot.last_synced.is_none());
  }

  #[tokio::test]
  async fn test_probe_updates_network() {
    let (sync, remote) = session(NetworkStatus::Offline);
    assert_eq!(sync.probe().await, NetworkStatus::Online);
    remote.set_reachable(false);
    assert_eq!(sync.probe().await, NetworkStatus::Offline);
    assert!(!sync.network().is_online());
  }
}
