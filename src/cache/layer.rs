//! Reference data cache that orchestrates caching logic with network fetching.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::connectivity::Connectivity;
use crate::forms::ApiError;
use crate::store::{read_json, write_json, KeyValueStore};

use super::debounce::WriteScheduler;
use super::traits::{CacheResult, CacheSource, Cacheable, GetOptions};

/// Default time after which cached data counts as stale.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Default persistence debounce window.
pub const DEFAULT_PERSIST_DELAY: Duration = Duration::from_millis(500);

/// Cache tuning.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
  pub ttl: Duration,
  pub persist_delay: Duration,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      ttl: DEFAULT_TTL,
      persist_delay: DEFAULT_PERSIST_DELAY,
    }
  }
}

/// In-memory state of one cached query.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  /// Records in server order
  pub payload: Vec<T>,
  /// Last successful network fetch in this process
  pub fetched_at: Option<DateTime<Utc>>,
  /// Timestamp recorded in the persisted mirror
  pub synced_at: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
  fn last_updated(&self) -> Option<DateTime<Utc>> {
    self.fetched_at.or(self.synced_at)
  }
}

type PersistedRecords<T> = HashMap<String, Vec<T>>;
type PersistedTimestamps = HashMap<String, i64>;

struct CacheState<T: Cacheable> {
  store: Arc<dyn KeyValueStore>,
  connectivity: Connectivity,
  ttl: chrono::Duration,
  entries: Mutex<HashMap<String, CacheEntry<T>>>,
  /// Single-flight locks; the sender is dropped when the fetch settles
  inflight: Mutex<HashMap<String, watch::Sender<()>>>,
  writer: WriteScheduler,
}

/// Per-key mirror of catalog data with single-flight fetching and debounced
/// persistence.
///
/// Reads never fail: network, decode and storage errors all degrade to the
/// best data available (memory, then persisted mirror, then empty).
pub struct ReferenceCache<T: Cacheable> {
  state: Arc<CacheState<T>>,
}

impl<T: Cacheable> ReferenceCache<T> {
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    connectivity: Connectivity,
    settings: CacheSettings,
  ) -> Self {
    let ttl = chrono::Duration::from_std(settings.ttl).unwrap_or(chrono::Duration::MAX);

    let state = Arc::new_cyclic(|weak: &Weak<CacheState<T>>| {
      let weak = weak.clone();
      CacheState {
        store,
        connectivity,
        ttl,
        entries: Mutex::new(HashMap::new()),
        inflight: Mutex::new(HashMap::new()),
        writer: WriteScheduler::new(settings.persist_delay, move || {
          if let Some(state) = weak.upgrade() {
            state.persist();
          }
        }),
      }
    });

    Self { state }
  }

  /// Resolve `key` from the network when possible, else from the cache.
  ///
  /// While online, a call that finds no fetch in flight for `key` runs
  /// `fetcher`. A call that finds one in flight performs no network I/O: it
  /// returns the best-known data right away, or with `force_refresh` waits
  /// for the in-flight fetch to settle first. Offline calls never fetch.
  pub async fn get<F, Fut>(&self, key: &str, options: GetOptions, fetcher: F) -> CacheResult<Vec<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>, ApiError>>,
  {
    if !self.state.connectivity.is_online() {
      debug!(entity = T::entity_type(), key, "Offline, serving cached data");
      return self.best_known(key);
    }

    let _lock = match self.state.try_lock_fetch(key) {
      Ok(lock) => lock,
      Err(mut in_flight) => {
        if options.force_refresh {
          // Err means the fetch settled and its sender was dropped
          let _ = in_flight.changed().await;
        }
        debug!(entity = T::entity_type(), key, "Fetch already in flight");
        return self.best_known(key);
      }
    };

    match fetcher().await {
      Ok(records) => {
        let fetched_at = Utc::now();
        self.state.lock_entries().insert(
          key.to_string(),
          CacheEntry {
            payload: records.clone(),
            fetched_at: Some(fetched_at),
            synced_at: Some(fetched_at),
          },
        );
        self.state.writer.schedule();
        CacheResult::from_network(records, fetched_at)
      }
      Err(e) => {
        warn!(
          entity = T::entity_type(),
          key,
          error = %e,
          "Fetch failed, falling back to cached data"
        );
        self.best_known(key)
      }
    }
  }

  /// Memory entry, else persisted mirror, else empty. No network I/O.
  pub fn best_known(&self, key: &str) -> CacheResult<Vec<T>> {
    if let Some(entry) = self.state.lock_entries().get(key) {
      return CacheResult::from_cache(
        entry.payload.clone(),
        CacheSource::Memory,
        entry.last_updated(),
        self.state.is_stale(entry.last_updated()),
      );
    }

    match self.state.load_persisted(key) {
      Some(entry) => {
        let result = CacheResult::from_cache(
          entry.payload.clone(),
          CacheSource::Persisted,
          entry.synced_at,
          self.state.is_stale(entry.synced_at),
        );
        self.state.lock_entries().insert(key.to_string(), entry);
        result
      }
      None => CacheResult::empty(),
    }
  }

  /// Whether a fetch for `key` is currently running.
  pub fn is_fetching(&self, key: &str) -> bool {
    self.state.lock_inflight().contains_key(key)
  }

  /// Drop the in-memory entry for `key`. The persisted mirror is kept.
  pub fn evict(&self, key: &str) {
    self.state.lock_entries().remove(key);
  }

  /// Forget everything, in memory and on disk.
  pub fn clear(&self) {
    self.state.writer.cancel();
    self.state.lock_entries().clear();

    for key in [records_key::<T>(), timestamps_key::<T>()] {
      if let Err(e) = self.state.store.remove(&key) {
        error!(key, error = %e, "Failed to clear persisted cache");
      }
    }
  }

  /// Write pending updates now (e.g. on shutdown).
  pub fn flush(&self) {
    self.state.writer.flush();
  }

  pub fn has_pending_write(&self) -> bool {
    self.state.writer.is_pending()
  }
}

impl<T: Cacheable> Clone for ReferenceCache<T> {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
    }
  }
}

/// Held for the duration of one fetch; releases the single-flight lock on drop.
struct FetchLock<T: Cacheable> {
  state: Arc<CacheState<T>>,
  key: String,
}

impl<T: Cacheable> Drop for FetchLock<T> {
  fn drop(&mut self) {
    self.state.lock_inflight().remove(&self.key);
  }
}

impl<T: Cacheable> CacheState<T> {
  fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_inflight(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<()>>> {
    self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Take the fetch lock for `key`, or get a receiver that closes when the
  /// current holder finishes.
  fn try_lock_fetch(self: &Arc<Self>, key: &str) -> Result<FetchLock<T>, watch::Receiver<()>> {
    let mut inflight = self.lock_inflight();
    if let Some(sender) = inflight.get(key) {
      return Err(sender.subscribe());
    }

    let (sender, _) = watch::channel(());
    inflight.insert(key.to_string(), sender);

    Ok(FetchLock {
      state: Arc::clone(self),
      key: key.to_string(),
    })
  }

  fn is_stale(&self, updated_at: Option<DateTime<Utc>>) -> bool {
    match updated_at {
      Some(at) => Utc::now() - at > self.ttl,
      None => true,
    }
  }

  fn load_persisted(&self, key: &str) -> Option<CacheEntry<T>> {
    let records: PersistedRecords<T> = match read_json(self.store.as_ref(), &records_key::<T>()) {
      Ok(records) => records?,
      Err(e) => {
        error!(entity = T::entity_type(), error = %e, "Failed to read persisted cache");
        return None;
      }
    };

    let payload = records.get(key)?.clone();
    let synced_at = self
      .load_timestamps()
      .get(key)
      .and_then(|ms| DateTime::from_timestamp_millis(*ms));

    Some(CacheEntry {
      payload,
      fetched_at: None,
      synced_at,
    })
  }

  fn load_timestamps(&self) -> PersistedTimestamps {
    match read_json(self.store.as_ref(), &timestamps_key::<T>()) {
      Ok(timestamps) => timestamps.unwrap_or_default(),
      Err(e) => {
        error!(entity = T::entity_type(), error = %e, "Failed to read cache timestamps");
        PersistedTimestamps::new()
      }
    }
  }

  /// Merge fetched entries into the persisted maps. Keys not held in memory
  /// keep their persisted value.
  fn persist(&self) {
    let fetched: Vec<(String, CacheEntry<T>)> = self
      .lock_entries()
      .iter()
      .filter(|(_, entry)| entry.fetched_at.is_some())
      .map(|(key, entry)| (key.clone(), entry.clone()))
      .collect();

    if fetched.is_empty() {
      return;
    }

    let mut records: PersistedRecords<T> =
      match read_json(self.store.as_ref(), &records_key::<T>()) {
        Ok(records) => records.unwrap_or_default(),
        Err(e) => {
          warn!(entity = T::entity_type(), error = %e, "Persisted cache unreadable, rewriting");
          PersistedRecords::new()
        }
      };
    let mut timestamps = self.load_timestamps();

    for (key, entry) in fetched {
      if let Some(at) = entry.fetched_at {
        timestamps.insert(key.clone(), at.timestamp_millis());
      }
      records.insert(key, entry.payload);
    }

    if let Err(e) = write_json(self.store.as_ref(), &records_key::<T>(), &records) {
      error!(entity = T::entity_type(), error = %e, "Failed to persist cache");
      return;
    }
    if let Err(e) = write_json(self.store.as_ref(), &timestamps_key::<T>(), &timestamps) {
      error!(entity = T::entity_type(), error = %e, "Failed to persist cache timestamps");
    }

    debug!(entity = T::entity_type(), keys = records.len(), "Persisted cache");
  }
}

fn records_key<T: Cacheable>() -> String {
  format!("{}_cache", T::entity_type())
}

fn timestamps_key<T: Cacheable>() -> String {
  format!("{}_timestamp", T::entity_type())
}
