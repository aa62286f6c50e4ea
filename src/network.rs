//! Connectivity tracking.
//!
//! [`NetworkMonitor`] is the single answer to "should we try the remote right
//! now". It is advisory: `Online` only means a request is worth attempting.
//! State changes arrive from a connectivity source (platform events, or the
//! reachability probe below) and are pushed to subscribers synchronously.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
  Online,
  Offline,
}

type Listener = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

struct MonitorInner {
  status: watch::Sender<NetworkStatus>,
  listeners: Mutex<Vec<(u64, Listener)>>,
  next_id: AtomicU64,
}

/// Shared, cloneable connectivity signal.
#[derive(Clone)]
pub struct NetworkMonitor {
  inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
  pub fn new(initial: NetworkStatus) -> Self {
    let (status, _) = watch::channel(initial);
    Self {
      inner: Arc::new(MonitorInner {
        status,
        listeners: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(1),
      }),
    }
  }

  pub fn current_status(&self) -> NetworkStatus {
    *self.inner.status.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current_status() == NetworkStatus::Online
  }

  /// Record a connectivity reading. Listeners run only on an actual
  /// transition, on the caller's thread. Returns whether the state changed.
  pub fn set_status(&self, status: NetworkStatus) -> bool {
    let changed = self.inner.status.send_if_modified(|current| {
      if *current == status {
        false
      } else {
        *current = status;
        true
      }
    });

    if changed {
      info!(?status, "network status changed");
      // Snapshot the listeners so callbacks may subscribe/unsubscribe freely
      let listeners: Vec<Listener> = match self.inner.listeners.lock() {
        Ok(guard) => guard.iter().map(|(_, l)| Arc::clone(l)).collect(),
        Err(poisoned) => poisoned.into_inner().iter().map(|(_, l)| Arc::clone(l)).collect(),
      };
      for listener in listeners {
        listener(status);
      }
    }

    changed
  }

  /// Register a callback for status transitions. Dropping (or calling
  /// [`Subscription::unsubscribe`] on) the returned handle removes it.
  pub fn subscribe(&self, callback: impl Fn(NetworkStatus) + Send + Sync + 'static) -> Subscription {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let mut listeners = match self.inner.listeners.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    listeners.push((id, Arc::new(callback)));

    Subscription {
      monitor: Arc::downgrade(&self.inner),
      id,
    }
  }

  /// Async view of the same signal, for tasks that await transitions.
  pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
    self.inner.status.subscribe()
  }
}

/// Handle returned by [`NetworkMonitor::subscribe`].
pub struct Subscription {
  monitor: Weak<MonitorInner>,
  id: u64,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.monitor.upgrade() {
      let mut listeners = match inner.listeners.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
      };
      listeners.retain(|(id, _)| *id != self.id);
    }
  }
}

/// Probe the remote once and feed the result into the monitor.
pub async fn probe_once(monitor: &NetworkMonitor, remote: &dyn RemoteApi) -> NetworkStatus {
  let status = match remote.ping().await {
    Ok(()) => NetworkStatus::Online,
    Err(e) => {
      debug!(error = %e, "reachability probe failed");
      NetworkStatus::Offline
    }
  };
  monitor.set_status(status);
  status
}

/// Spawn a reachability probe that runs every `interval`, acting as the
/// connectivity event source where no platform notifications exist.
pub fn spawn_probe(
  monitor: NetworkMonitor,
  remote: Arc<dyn RemoteApi>,
  interval: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      if probe_once(&monitor, remote.as_ref()).await == NetworkStatus::Offline {
        warn!("remote unreachable, working offline");
      }
    }
  })
}
