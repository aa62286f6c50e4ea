//! Scripted in-memory remote used by the tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{RemoteApi, RemoteError};
use crate::cache::EntityId;
use crate::queue::{PendingAction, QueuedAction};
use crate::store::Table;

/// How a scripted replay should fail.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
  Unreachable,
  Rejected(u16),
  Throttled,
  Unauthorized(u16),
}

impl Failure {
  fn to_error(self) -> RemoteError {
    match self {
      Failure::Unreachable => RemoteError::Unreachable("connection refused".into()),
      Failure::Rejected(status) => RemoteError::Rejected {
        status,
        body: "rejected".into(),
      },
      Failure::Throttled => RemoteError::Throttled,
      Failure::Unauthorized(status) => RemoteError::Unauthorized { status },
    }
  }
}

#[derive(Default)]
pub struct FakeRemote {
  collections: Mutex<HashMap<String, Vec<Value>>>,
  failing_collections: Mutex<HashSet<String>>,
  failing_targets: Mutex<HashMap<(Table, EntityId), Failure>>,
  failing_kinds: Mutex<HashMap<&'static str, Failure>>,
  fetch_delay: Mutex<Option<Duration>>,
  replay_delay: Mutex<Option<Duration>>,
  unreachable: AtomicBool,
  fetch_calls: AtomicUsize,
  replayed: Mutex<Vec<PendingAction>>,
  replay_attempts: AtomicUsize,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_collection(&self, endpoint: &str, items: Vec<Value>) {
    self
      .collections
      .lock()
      .unwrap()
      .insert(endpoint.to_string(), items);
  }

  pub fn fail_collection(&self, endpoint: &str) {
    self
      .failing_collections
      .lock()
      .unwrap()
      .insert(endpoint.to_string());
  }

  pub fn fail_target(&self, table: Table, id: i64, failure: Failure) {
    self
      .failing_targets
      .lock()
      .unwrap()
      .insert((table, EntityId::Num(id)), failure);
  }

  pub fn heal_target(&self, table: Table, id: i64) {
    self
      .failing_targets
      .lock()
      .unwrap()
      .remove(&(table, EntityId::Num(id)));
  }

  /// Fail every replay of one action kind, whatever its target.
  pub fn fail_kind(&self, kind: &'static str, failure: Failure) {
    self.failing_kinds.lock().unwrap().insert(kind, failure);
  }

  pub fn set_fetch_delay(&self, delay: Duration) {
    *self.fetch_delay.lock().unwrap() = Some(delay);
  }

  pub fn set_replay_delay(&self, delay: Duration) {
    *self.replay_delay.lock().unwrap() = Some(delay);
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.unreachable.store(!reachable, Ordering::SeqCst);
  }

  pub fn fetch_calls(&self) -> usize {
    self.fetch_calls.load(Ordering::SeqCst)
  }

  pub fn replay_attempts(&self) -> usize {
    self.replay_attempts.load(Ordering::SeqCst)
  }

  /// Actions the remote accepted, in arrival order.
  pub fn replayed(&self) -> Vec<PendingAction> {
    self.replayed.lock().unwrap().clone()
  }
}

#[async_trait]
impl RemoteApi for FakeRemote {
  async fn fetch_collection(&self, endpoint: &str) -> Result<Vec<Value>, RemoteError> {
    self.fetch_calls.fetch_add(1, Ordering::SeqCst);

    let delay = *self.fetch_delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.unreachable.load(Ordering::SeqCst)
      || self.failing_collections.lock().unwrap().contains(endpoint)
    {
      return Err(RemoteError::Unreachable("connection refused".into()));
    }

    Ok(
      self
        .collections
        .lock()
        .unwrap()
        .get(endpoint)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn replay(&self, item: &QueuedAction) -> Result<(), RemoteError> {
    self.replay_attempts.fetch_add(1, Ordering::SeqCst);
    let delay = *self.replay_delay.lock().unwrap();
    match delay {
      Some(delay) => tokio::time::sleep(delay).await,
      None => tokio::task::yield_now().await,
    }

    if self.unreachable.load(Ordering::SeqCst) {
      return Err(Failure::Unreachable.to_error());
    }

    let failure = self
      .failing_targets
      .lock()
      .unwrap()
      .get(&item.action.target())
      .copied()
      .or_else(|| self.failing_kinds.lock().unwrap().get(item.action.kind()).copied());
    if let Some(failure) = failure {
      return Err(failure.to_error());
    }

    self.replayed.lock().unwrap().push(item.action.clone());
    Ok(())
  }

  async fn ping(&self) -> Result<(), RemoteError> {
    if self.unreachable.load(Ordering::SeqCst) {
      Err(Failure::Unreachable.to_error())
    } else {
      Ok(())
    }
  }
}
