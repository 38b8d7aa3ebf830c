//! Coalescing write scheduler.
//!
//! One pending flag plus one delay timer: every `schedule()` inside the
//! window folds into the single write that fires when the timer expires.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

type WriteAction = Box<dyn Fn() + Send + Sync>;

struct SchedulerInner {
  delay: Duration,
  pending: Mutex<Option<JoinHandle<()>>>,
  action: WriteAction,
}

/// Debounced writer.
#[derive(Clone)]
pub struct WriteScheduler {
  inner: Arc<SchedulerInner>,
}

impl WriteScheduler {
  pub fn new<F>(delay: Duration, action: F) -> Self
  where
    F: Fn() + Send + Sync + 'static,
  {
    Self {
      inner: Arc::new(SchedulerInner {
        delay,
        pending: Mutex::new(None),
        action: Box::new(action),
      }),
    }
  }

  /// Request a write. No-op while one is already pending.
  ///
  /// Must be called from within a tokio runtime.
  pub fn schedule(&self) {
    let mut pending = self.lock_pending();
    if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
      return;
    }

    let inner = Arc::clone(&self.inner);
    *pending = Some(tokio::spawn(async move {
      tokio::time::sleep(inner.delay).await;
      // Clear the flag first so updates during the write schedule another one
      inner
        .pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
      (inner.action)();
    }));
  }

  pub fn is_pending(&self) -> bool {
    self
      .lock_pending()
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }

  /// Drop the pending write, if any.
  pub fn cancel(&self) {
    if let Some(handle) = self.lock_pending().take() {
      handle.abort();
    }
  }

  /// Run the pending write now. Returns whether a write was pending.
  pub fn flush(&self) -> bool {
    let pending = self.lock_pending().take();
    match pending {
      Some(handle) if !handle.is_finished() => {
        handle.abort();
        (self.inner.action)();
        true
      }
      _ => false,
    }
  }

  fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    self
      .inner
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }
}
