//! Replays queued mutations against the remote.
//!
//! Items are drained strictly in FIFO order, one at a time. A failed item
//! stays queued for the next drain and the drain moves on to the next item.
//! With same-entity deferral enabled, later items for the entity of a failed
//! item are held back until it goes through instead.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::action::{PendingAction, QueuedAction};
use crate::api::{RemoteApi, Tenant, TenantStatus, Voter};
use crate::cache::{Entity, EntityId};
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::store::{LocalStore, StoreError, Table};

/// Why a drain did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainSkip {
  /// Another drain holds the guard
  AlreadyRunning,
  Offline,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Confirmed by the remote and removed from the queue
  pub committed: usize,
  /// Attempted, failed, still queued
  pub retained: usize,
  /// Not attempted because an earlier item for the same entity failed
  /// (same-entity deferral only)
  pub deferred: usize,
  /// Given up on after too many rejections
  pub dead_lettered: usize,
  pub skipped: Option<DrainSkip>,
}

impl DrainReport {
  fn skipped(reason: DrainSkip) -> Self {
    Self {
      skipped: Some(reason),
      ..Self::default()
    }
  }
}

/// A queued action and, when the caller waited for it, the drain that
/// followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
  pub item: QueuedAction,
  /// `None` when offline or when the drain was left to run in the background
  pub drained: Option<DrainReport>,
}

/// Queue state published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueState {
  pub pending: usize,
  pub is_draining: bool,
  pub last_report: Option<DrainReport>,
}

struct ProcessorInner {
  store: Arc<LocalStore>,
  remote: Arc<dyn RemoteApi>,
  network: NetworkMonitor,
  /// 0 disables the dead-letter cutoff
  max_rejections: u32,
  defer_same_entity: AtomicBool,
  drain_guard: Mutex<()>,
  state: watch::Sender<QueueState>,
}

/// Pending-action queue processor. Cheap to clone; clones share one guard.
#[derive(Clone)]
pub struct QueueProcessor {
  inner: Arc<ProcessorInner>,
}

impl QueueProcessor {
  pub fn new(
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApi>,
    network: NetworkMonitor,
    max_rejections: u32,
  ) -> Self {
    let pending = store.queue_len().unwrap_or_else(|e| {
      warn!(error = %e, "cannot read queue length");
      0
    });
    let (state, _) = watch::channel(QueueState {
      pending,
      ..QueueState::default()
    });

    Self {
      inner: Arc::new(ProcessorInner {
        store,
        remote,
        network,
        max_rejections,
        defer_same_entity: AtomicBool::new(false),
        drain_guard: Mutex::new(()),
        state,
      }),
    }
  }

  /// Hold back later items for an entity whose earlier item failed in the
  /// same drain. Off by default: every item is attempted in order.
  pub fn set_defer_same_entity(&self, enabled: bool) {
    self.inner.defer_same_entity.store(enabled, Ordering::Relaxed);
  }

  pub fn subscribe(&self) -> watch::Receiver<QueueState> {
    self.inner.state.subscribe()
  }

  pub fn pending(&self) -> Result<Vec<QueuedAction>, StoreError> {
    self.inner.store.pending_actions()
  }

  /// Apply the action to the cached record and append it to the queue.
  ///
  /// Local-only: never touches the network.
  pub fn enqueue(&self, action: PendingAction) -> Result<QueuedAction, StoreError> {
    match self.apply_optimistic(&action) {
      Ok(true) => {}
      Ok(false) => debug!(action = action.kind(), "target not cached, queueing without local patch"),
      Err(e) => warn!(action = action.kind(), error = %e, "optimistic update failed"),
    }

    let item = self.inner.store.enqueue_action(&action, Utc::now())?;
    info!(seq = item.seq, action = action.kind(), "queued pending action");
    self.publish_pending();
    Ok(item)
  }

  /// Enqueue, then drain if the network looks usable.
  ///
  /// With `wait_for_drain` the drain runs before returning and its report is
  /// handed back; otherwise it is spawned in the background.
  pub async fn submit(
    &self,
    action: PendingAction,
    wait_for_drain: bool,
  ) -> Result<Submission, StoreError> {
    let item = self.enqueue(action)?;
    if !self.inner.network.is_online() {
      return Ok(Submission { item, drained: None });
    }

    if wait_for_drain {
      let report = self.drain().await;
      return Ok(Submission {
        item,
        drained: Some(report),
      });
    }

    let this = self.clone();
    tokio::spawn(async move {
      this.drain().await;
    });
    Ok(Submission { item, drained: None })
  }

  /// Replay every queued item, oldest first.
  ///
  /// Single-flight: a drain started while another is running returns
  /// immediately with [`DrainSkip::AlreadyRunning`], so no item is ever
  /// submitted twice concurrently.
  pub async fn drain(&self) -> DrainReport {
    let Ok(_guard) = self.inner.drain_guard.try_lock() else {
      debug!("drain already running");
      return DrainReport::skipped(DrainSkip::AlreadyRunning);
    };

    if !self.inner.network.is_online() {
      return DrainReport::skipped(DrainSkip::Offline);
    }

    self.inner.state.send_modify(|s| s.is_draining = true);
    let report = self.drain_locked().await;
    let pending = self.current_pending();
    self.inner.state.send_modify(|s| {
      s.is_draining = false;
      if let Some(pending) = pending {
        s.pending = pending;
      }
      s.last_report = Some(report.clone());
    });

    if report.committed + report.retained + report.dead_lettered > 0 {
      info!(
        committed = report.committed,
        retained = report.retained,
        deferred = report.deferred,
        dead_lettered = report.dead_lettered,
        "drained pending actions"
      );
    }
    report
  }

  async fn drain_locked(&self) -> DrainReport {
    let mut report = DrainReport::default();
    let defer = self.inner.defer_same_entity.load(Ordering::Relaxed);
    let session = self.inner.store.session();
    let mut blocked: HashSet<(Table, EntityId)> = HashSet::new();
    let mut cursor = 0i64;

    // Keep going while new items arrive during the drain
    loop {
      let batch = match self.inner.store.pending_actions_after(cursor) {
        Ok(batch) => batch,
        Err(e) => {
          error!(error = %e, "cannot read pending actions");
          break;
        }
      };
      if batch.is_empty() {
        break;
      }

      for item in batch {
        if self.inner.store.session() != session {
          info!("session ended, stopping drain");
          return report;
        }
        cursor = item.seq;
        let target = item.action.target();

        if defer && blocked.contains(&target) {
          report.deferred += 1;
          continue;
        }

        match self.inner.remote.replay(&item).await {
          Ok(()) => match self.inner.store.complete_action(item.seq) {
            Ok(_) => report.committed += 1,
            Err(e) => {
              // Applied remotely but still queued; the idempotency key covers the resend
              error!(seq = item.seq, error = %e, "failed to remove replayed action");
              blocked.insert(target);
              report.retained += 1;
            }
          },
          Err(err) => {
            warn!(seq = item.seq, action = item.action.kind(), error = %err, "replay failed, keeping in queue");
            blocked.insert(target);

            if err.is_rejection() && self.should_dead_letter(item.seq, &err.to_string()) {
              match self.inner.store.dead_letter_action(item.seq, &err.to_string()) {
                Ok(_) => {
                  warn!(seq = item.seq, "moved repeatedly rejected action to dead letters");
                  report.dead_lettered += 1;
                  continue;
                }
                Err(e) => error!(seq = item.seq, error = %e, "failed to dead-letter action"),
              }
            }
            report.retained += 1;
          }
        }
      }
    }

    report
  }

  fn should_dead_letter(&self, seq: i64, error: &str) -> bool {
    if self.inner.max_rejections == 0 {
      return false;
    }
    match self.inner.store.record_rejection(seq, error) {
      Ok(count) => count >= self.inner.max_rejections,
      Err(e) => {
        warn!(seq, error = %e, "failed to record rejection");
        false
      }
    }
  }

  /// Drain now if online, then again on every transition to online.
  pub fn spawn_auto_drain(&self) -> JoinHandle<()> {
    let this = self.clone();
    let mut status = self.inner.network.watch();

    tokio::spawn(async move {
      if *status.borrow_and_update() == NetworkStatus::Online {
        this.drain().await;
      }
      while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        if current == NetworkStatus::Online {
          this.drain().await;
        }
      }
    })
  }

  /// Forget everything queued (used on logout).
  pub fn clear(&self) -> Result<usize, StoreError> {
    let removed = self.inner.store.clear_queue()?;
    self.publish_pending();
    Ok(removed)
  }

  fn publish_pending(&self) {
    if let Some(pending) = self.current_pending() {
      self.inner.state.send_modify(|s| s.pending = pending);
    }
  }

  /// Queue depth, or `None` (keeping the last published value) when the
  /// store cannot be read.
  fn current_pending(&self) -> Option<usize> {
    match self.inner.store.queue_len() {
      Ok(pending) => Some(pending),
      Err(e) => {
        warn!(error = %e, "cannot read queue length");
        None
      }
    }
  }

  fn apply_optimistic(&self, action: &PendingAction) -> Result<bool, StoreError> {
    match action {
      PendingAction::UpdateVoterStatus { voter_id, status } => {
        self.patch::<Voter>(&EntityId::Num(*voter_id), |v| {
          v.support_level = status.as_str().to_string();
          v.is_visited = true;
        })
      }
      PendingAction::MarkVoted {
        voter_id,
        has_voted,
      } => self.patch::<Voter>(&EntityId::Num(*voter_id), |v| v.has_voted = *has_voted),
      PendingAction::SetTenantStatus { tenant_id, active } => {
        self.patch::<Tenant>(&EntityId::Num(*tenant_id), |t| {
          t.status = TenantStatus::Active(*active)
        })
      }
    }
  }

  fn patch<T: Entity>(&self, id: &EntityId, f: impl FnOnce(&mut T)) -> Result<bool, StoreError> {
    match self.inner.store.get::<T>(id)? {
      Some(mut record) => {
        f(&mut record);
        self.inner.store.put(&record)?;
        Ok(true)
      }
      None => Ok(false),
    }
  }
}
