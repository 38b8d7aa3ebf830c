//! Drains the outbox when connectivity returns or the user asks for it.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connectivity::Connectivity;
use crate::forms::FormsApi;
use crate::outbox::{Outbox, OutboxEntry};
use crate::session::Session;
use crate::store::{read_json, write_json, KeyValueStore};

use super::protocol::SubmissionProtocol;

pub const LAST_SYNC_KEY: &str = "last_sync_at";

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Draining,
}

/// Signals for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  DrainStarted { pending: usize },
  EntrySucceeded { id: String },
  EntryFailed { id: String, error: String },
  DrainFinished(DrainReport),
  /// The backend rejected the session; the user must log in again
  SessionExpired,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub succeeded: usize,
  pub failed: usize,
  /// Entries still queued after the pass
  pub remaining: usize,
  /// The pass stopped on a 401
  pub session_expired: bool,
  /// The pass did not run (no session)
  pub skipped: bool,
}

/// Result of an immediate submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// Every step succeeded
  Submitted,
  /// Offline or failed; stored in the outbox for replay
  Queued,
  /// Rejected with 401; not queued
  SessionExpired,
}

pub struct SyncCoordinator<A: FormsApi> {
  outbox: Outbox,
  protocol: SubmissionProtocol<A>,
  session: Session,
  connectivity: Connectivity,
  store: Arc<dyn KeyValueStore>,
  /// Held for the duration of a pass; passes never overlap
  drain_lock: Mutex<()>,
  state: watch::Sender<SyncState>,
  events: broadcast::Sender<SyncEvent>,
}

impl<A: FormsApi + 'static> SyncCoordinator<A> {
  pub fn new(
    outbox: Outbox,
    protocol: SubmissionProtocol<A>,
    session: Session,
    connectivity: Connectivity,
    store: Arc<dyn KeyValueStore>,
  ) -> Self {
    let (state, _) = watch::channel(SyncState::Idle);
    let (events, _) = broadcast::channel(64);

    Self {
      outbox,
      protocol,
      session,
      connectivity,
      store,
      drain_lock: Mutex::new(()),
      state,
      events,
    }
  }

  pub fn state(&self) -> SyncState {
    *self.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<SyncState> {
    self.state.subscribe()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn outbox(&self) -> &Outbox {
    &self.outbox
  }

  /// When the last pass with at least one success finished.
  pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
    read_json(self.store.as_ref(), LAST_SYNC_KEY).ok().flatten()
  }

  /// Submit a write now, or queue it when offline or when the attempt fails.
  pub async fn submit(&self, entry: OutboxEntry) -> SubmitOutcome {
    if !self.connectivity.is_online() {
      self.outbox.enqueue(entry);
      return SubmitOutcome::Queued;
    }

    match self.protocol.execute(&entry).await {
      Ok(()) => SubmitOutcome::Submitted,
      Err(e) if e.is_unauthorized() => {
        self.expire_session();
        SubmitOutcome::SessionExpired
      }
      Err(e) => {
        warn!(id = %entry.id, kind = entry.label(), error = %e, "Submission failed, queueing");
        self.outbox.enqueue(entry);
        SubmitOutcome::Queued
      }
    }
  }

  /// Replay every queued entry.
  pub async fn drain(&self) -> DrainReport {
    self.run_pass(None).await
  }

  /// Replay only the entries for subject `id`.
  pub async fn retry(&self, id: &str) -> DrainReport {
    self.run_pass(Some(id)).await
  }

  /// Drain now if online, then on every offline→online transition.
  pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
    // Subscribe before spawning so no transition is missed
    let changes = self.connectivity.watch();
    let coordinator = Arc::clone(self);
    tokio::spawn(async move { coordinator.follow_connectivity(changes).await })
  }

  async fn follow_connectivity(&self, mut changes: watch::Receiver<bool>) {
    let mut was_online = *changes.borrow_and_update();
    if was_online && !self.outbox.is_empty() {
      self.drain().await;
    }

    while changes.changed().await.is_ok() {
      let online = *changes.borrow_and_update();
      if online && !was_online {
        info!("Back online, draining outbox");
        self.drain().await;
      }
      was_online = online;
    }
  }

  async fn run_pass(&self, only: Option<&str>) -> DrainReport {
    let _pass = self.drain_lock.lock().await;

    if self.session.token().is_none() {
      debug!("No session, skipping drain");
      return DrainReport {
        remaining: self.outbox.len(),
        skipped: true,
        ..DrainReport::default()
      };
    }

    let entries: Vec<OutboxEntry> = self
      .outbox
      .peek_all()
      .into_iter()
      .filter(|entry| only.map_or(true, |id| entry.id == id))
      .collect();

    if entries.is_empty() {
      return DrainReport {
        remaining: self.outbox.len(),
        ..DrainReport::default()
      };
    }

    let _draining = DrainingGuard::enter(&self.state);
    info!(pending = entries.len(), "Draining outbox");
    self.emit(SyncEvent::DrainStarted {
      pending: entries.len(),
    });

    let mut report = DrainReport::default();
    let mut succeeded: HashSet<Uuid> = HashSet::new();

    for entry in &entries {
      match self.protocol.execute(entry).await {
        Ok(()) => {
          report.succeeded += 1;
          succeeded.insert(entry.uid);
          self.emit(SyncEvent::EntrySucceeded {
            id: entry.id.clone(),
          });
        }
        Err(e) if e.is_unauthorized() => {
          report.session_expired = true;
          self.expire_session();
          break;
        }
        Err(e) => {
          report.failed += 1;
          warn!(id = %entry.id, kind = entry.label(), error = %e, "Replay failed, keeping entry");
          self.emit(SyncEvent::EntryFailed {
            id: entry.id.clone(),
            error: e.to_string(),
          });
        }
      }
    }

    // Entries queued during the pass are kept after the survivors
    self
      .outbox
      .retain(|entry| !succeeded.contains(&entry.uid));
    report.remaining = self.outbox.len();

    if report.succeeded > 0 {
      if let Err(e) = write_json(self.store.as_ref(), LAST_SYNC_KEY, &Utc::now()) {
        error!(error = %e, "Failed to record last sync time");
      }
    }

    info!(
      succeeded = report.succeeded,
      failed = report.failed,
      remaining = report.remaining,
      "Drain finished"
    );
    self.emit(SyncEvent::DrainFinished(report.clone()));
    report
  }

  fn expire_session(&self) {
    self.session.invalidate();
    self.emit(SyncEvent::SessionExpired);
  }

  fn emit(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

/// Marks the coordinator as draining until dropped.
struct DrainingGuard<'a> {
  state: &'a watch::Sender<SyncState>,
}

impl<'a> DrainingGuard<'a> {
  fn enter(state: &'a watch::Sender<SyncState>) -> Self {
    state.send_replace(SyncState::Draining);
    Self { state }
  }
}

impl Drop for DrainingGuard<'_> {
  fn drop(&mut self) {
    self.state.send_replace(SyncState::Idle);
  }
}
