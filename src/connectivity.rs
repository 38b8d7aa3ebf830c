//! Process-wide online/offline state.
//!
//! The host platform (or the reachability probe when there is none) reports
//! every network event through [`Connectivity::set_online`]. Listeners are
//! called for every report, so consumers must tolerate repeated identical
//! values; async consumers use [`Connectivity::watch`] instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

struct Inner {
  state: watch::Sender<bool>,
  listeners: Mutex<Vec<(u64, Listener)>>,
  next_id: AtomicU64,
}

/// Shared handle to the connectivity state.
#[derive(Clone)]
pub struct Connectivity {
  inner: Arc<Inner>,
}

impl Connectivity {
  /// Create the observer from the platform's initial probe.
  ///
  /// An unavailable signal (`None`) counts as online, so writes fall back to
  /// failure-driven offline detection instead of queueing forever.
  pub fn new(initial: Option<bool>) -> Self {
    let online = initial.unwrap_or(true);
    let (state, _) = watch::channel(online);

    Self {
      inner: Arc::new(Inner {
        state,
        listeners: Mutex::new(Vec::new()),
        next_id: AtomicU64::new(0),
      }),
    }
  }

  /// Current state.
  pub fn is_online(&self) -> bool {
    *self.inner.state.borrow()
  }

  /// Platform notification entry point.
  pub fn set_online(&self, online: bool) {
    let previous = self.inner.state.send_replace(online);
    if previous != online {
      info!(online, "Connectivity changed");
    }

    let listeners: Vec<Listener> = self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .iter()
      .map(|(_, listener)| Arc::clone(listener))
      .collect();

    for listener in listeners {
      listener(online);
    }
  }

  /// Register a callback invoked on every reported state.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push((id, Arc::new(listener)));

    Subscription {
      id,
      inner: Arc::downgrade(&self.inner),
    }
  }

  /// Receiver that observes every reported state.
  pub fn watch(&self) -> watch::Receiver<bool> {
    self.inner.state.subscribe()
  }

  /// Feed this observer from periodic HEAD requests against `url`.
  ///
  /// Any HTTP response counts as online; only transport errors mean offline.
  pub fn spawn_probe(&self, client: reqwest::Client, url: Url, interval: Duration) -> JoinHandle<()> {
    let connectivity = self.clone();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let online = match client.head(url.clone()).send().await {
          Ok(_) => true,
          Err(e) => {
            debug!(error = %e, "Reachability probe failed");
            false
          }
        };
        connectivity.set_online(online);
      }
    })
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(None)
  }
}

/// Handle returned by [`Connectivity::subscribe`]. Dropping it detaches the
/// listener.
pub struct Subscription {
  id: u64,
  inner: Weak<Inner>,
}

impl Subscription {
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      inner
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|(id, _)| *id != self.id);
    }
  }
}
