//! Durable FIFO of pending writes.
//!
//! The whole queue is persisted as one JSON array under [`OUTBOX_KEY`] on
//! every change, so the stored value is always a complete snapshot. Stored
//! values that no longer decode are moved to [`QUARANTINE_KEY`], never
//! overwritten.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::forms::types::lenient_id;
use crate::forms::{ApprovalDecision, Attachment};
use crate::store::{write_json, KeyValueStore, StoreError};

use super::entry::{OutboxEntry, OutboxKind};

pub const OUTBOX_KEY: &str = "outbox_queue";

/// Approval actions written by older builds, imported on load.
pub const LEGACY_APPROVAL_KEY: &str = "approval_offline_actions";

/// Raw queue records that could not be decoded, kept for manual recovery.
pub const QUARANTINE_KEY: &str = "outbox_queue_corrupt";

#[derive(Debug, Deserialize)]
struct LegacyApprovalAction {
  #[serde(alias = "id", alias = "responseId", deserialize_with = "lenient_id")]
  response_id: String,
  status: String,
  #[serde(default)]
  message: String,
  #[serde(default)]
  files: Vec<Attachment>,
  #[serde(default, alias = "timestamp", deserialize_with = "lenient_timestamp")]
  created_at: Option<DateTime<Utc>>,
}

/// Accept epoch milliseconds or an RFC 3339 string.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum RawTimestamp {
    Millis(i64),
    FractionalMillis(f64),
    Text(DateTime<Utc>),
  }

  Ok(match Option::<RawTimestamp>::deserialize(deserializer)? {
    None => None,
    Some(RawTimestamp::Millis(ms)) => Utc.timestamp_millis_opt(ms).single(),
    Some(RawTimestamp::FractionalMillis(ms)) => Utc.timestamp_millis_opt(ms as i64).single(),
    Some(RawTimestamp::Text(at)) => Some(at),
  })
}

/// Shared handle to the outbox.
#[derive(Clone)]
pub struct Outbox {
  store: Arc<dyn KeyValueStore>,
  entries: Arc<Mutex<Vec<OutboxEntry>>>,
  /// Undecodable raw records not yet written to the quarantine key
  rejected: Arc<Mutex<Vec<Value>>>,
}

impl Outbox {
  /// Restore the queue from `store`, importing legacy approval actions.
  pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
    let (mut entries, rejected) = match store.get(OUTBOX_KEY) {
      Ok(Some(raw)) => decode_lenient(raw),
      Ok(None) => (Vec::new(), Vec::new()),
      Err(e) => {
        error!(error = %e, "Persisted outbox unreadable, starting empty");
        (Vec::new(), Vec::new())
      }
    };
    // Stable sort keeps insertion order for equal timestamps
    entries.sort_by_key(|entry: &OutboxEntry| entry.created_at);

    let outbox = Self {
      store,
      entries: Arc::new(Mutex::new(entries)),
      rejected: Arc::new(Mutex::new(rejected)),
    };

    if outbox.has_rejected() {
      let entries = outbox.lock();
      // Persist now so the bad records leave the queue key only once quarantined
      let _ = outbox.persist(&entries);
    }
    outbox.import_legacy_approvals();
    outbox
  }

  /// Append `entry` and persist the whole queue.
  pub fn enqueue(&self, entry: OutboxEntry) {
    info!(id = %entry.id, kind = entry.label(), "Queued for sync");

    let mut entries = self.lock();
    entries.push(entry);
    let _ = self.persist(&entries);
  }

  /// Snapshot of all entries in replay order.
  pub fn peek_all(&self) -> Vec<OutboxEntry> {
    self.lock().clone()
  }

  /// Entries whose subject is `id`.
  pub fn find(&self, id: &str) -> Vec<OutboxEntry> {
    self
      .lock()
      .iter()
      .filter(|entry| entry.id == id)
      .cloned()
      .collect()
  }

  /// Drop every entry for subject `id`. Returns how many were removed.
  pub fn remove_by_id(&self, id: &str) -> usize {
    let mut entries = self.lock();
    let before = entries.len();
    entries.retain(|entry| entry.id != id);
    let removed = before - entries.len();
    if removed > 0 {
      let _ = self.persist(&entries);
    }
    removed
  }

  /// Replace the queue with `remaining`.
  pub fn replace_all(&self, remaining: Vec<OutboxEntry>) {
    let mut entries = self.lock();
    *entries = remaining;
    let _ = self.persist(&entries);
  }

  /// Keep only the entries matching `keep`, in order, as one atomic update.
  pub fn retain<F>(&self, keep: F)
  where
    F: FnMut(&OutboxEntry) -> bool,
  {
    let mut entries = self.lock();
    entries.retain(keep);
    let _ = self.persist(&entries);
  }

  /// Discard every pending write.
  pub fn clear(&self) {
    warn!("Clearing outbox");
    self.replace_all(Vec::new());
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn lock(&self) -> MutexGuard<'_, Vec<OutboxEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn has_rejected(&self) -> bool {
    !self
      .rejected
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .is_empty()
  }

  /// Write the full snapshot; an empty queue removes the key instead.
  ///
  /// Pending rejected records are quarantined first. While that fails the
  /// queue key is left untouched so they are not lost.
  fn persist(&self, entries: &[OutboxEntry]) -> Result<(), StoreError> {
    let result = self.flush_rejected().and_then(|()| {
      if entries.is_empty() {
        self.store.remove(OUTBOX_KEY)
      } else {
        write_json(self.store.as_ref(), OUTBOX_KEY, entries)
      }
    });

    match &result {
      Ok(()) => debug!(pending = entries.len(), "Persisted outbox"),
      Err(e) => error!(error = %e, "Failed to persist outbox, keeping it in memory"),
    }
    result
  }

  /// Append rejected records to [`QUARANTINE_KEY`].
  fn flush_rejected(&self) -> Result<(), StoreError> {
    let mut rejected = self.rejected.lock().unwrap_or_else(PoisonError::into_inner);
    if rejected.is_empty() {
      return Ok(());
    }

    let mut quarantined: Vec<Value> = match self.store.get(QUARANTINE_KEY)? {
      Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| vec![Value::String(raw)]),
      None => Vec::new(),
    };
    quarantined.extend(rejected.iter().cloned());
    write_json(self.store.as_ref(), QUARANTINE_KEY, &quarantined)?;

    warn!(
      count = rejected.len(),
      key = QUARANTINE_KEY,
      "Moved undecodable outbox records to quarantine"
    );
    rejected.clear();
    Ok(())
  }

  fn import_legacy_approvals(&self) {
    let raw = match self.store.get(LEGACY_APPROVAL_KEY) {
      Ok(Some(raw)) => raw,
      Ok(None) => return,
      Err(e) => {
        warn!(error = %e, "Legacy approval actions unreadable, leaving them in place");
        return;
      }
    };

    let (actions, rejected): (Vec<LegacyApprovalAction>, Vec<Value>) = decode_lenient(raw);
    if !rejected.is_empty() {
      self
        .rejected
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .extend(rejected);
    }

    let imported = actions.len();
    let persisted = {
      let mut entries = self.lock();
      for action in actions {
        let created_at = action.created_at.unwrap_or_else(Utc::now);
        entries.push(OutboxEntry::with_created_at(
          OutboxKind::ApprovalDecision(ApprovalDecision {
            response_id: action.response_id,
            status: action.status,
            message: action.message,
            files: action.files,
          }),
          created_at,
        ));
      }
      entries.sort_by_key(|entry| entry.created_at);
      self.persist(&entries)
    };

    // The legacy key is the only durable copy until the queue is written
    if persisted.is_err() {
      warn!("Keeping legacy approval actions until the outbox can be written");
      return;
    }
    if let Err(e) = self.store.remove(LEGACY_APPROVAL_KEY) {
      error!(error = %e, "Failed to remove legacy approval actions");
    }
    info!(imported, "Imported legacy approval actions into outbox");
  }
}

/// Decode a stored JSON array element by element. Elements that do not
/// decode, or the whole value when it is not an array, are returned raw.
fn decode_lenient<T: serde::de::DeserializeOwned>(raw: String) -> (Vec<T>, Vec<Value>) {
  let items = match serde_json::from_str::<Value>(&raw) {
    Ok(Value::Array(items)) => items,
    Ok(other) => return (Vec::new(), vec![other]),
    Err(_) => return (Vec::new(), vec![Value::String(raw)]),
  };

  let mut decoded = Vec::with_capacity(items.len());
  let mut rejected = Vec::new();
  for item in items {
    match serde_json::from_value::<T>(item.clone()) {
      Ok(value) => decoded.push(value),
      Err(e) => {
        warn!(error = %e, "Stored record did not decode");
        rejected.push(item);
      }
    }
  }

  (decoded, rejected)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::forms::Answer;
  use crate::store::{read_json, MemoryStore};
  use serde_json::json;

  /// Memory store whose writes to one key fail.
  struct RejectingStore {
    inner: Arc<MemoryStore>,
    rejected_key: &'static str,
  }

  impl KeyValueStore for RejectingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
      if key == self.rejected_key {
        return Err(StoreError::Poisoned);
      }
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
      self.inner.remove(key)
    }
  }

  fn submission(form_id: &str) -> OutboxEntry {
    OutboxEntry::form_submission(form_id, vec![Answer::new("q1", json!(1))])
  }

  fn persisted_ids(store: &dyn KeyValueStore) -> Option<Vec<String>> {
    let entries: Option<Vec<OutboxEntry>> = read_json(store, OUTBOX_KEY).unwrap();
    entries.map(|entries| entries.into_iter().map(|e| e.id).collect())
  }

  #[test]
  fn test_enqueue_persists_full_queue_in_order() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let outbox = Outbox::load(Arc::clone(&store));

    outbox.enqueue(submission("a"));
    outbox.enqueue(submission("b"));
    outbox.enqueue(submission("c"));

    assert_eq!(
      persisted_ids(store.as_ref()),
      Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
    );

    let reloaded = Outbox::load(store);
    let ids: Vec<_> = reloaded.peek_all().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, ["a", "b", "c"]);
  }

  #[test]
  fn test_empty_queue_removes_key() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let outbox = Outbox::load(Arc::clone(&store));

    outbox.enqueue(submission("a"));
    assert!(store.get(OUTBOX_KEY).unwrap().is_some());

    assert_eq!(outbox.remove_by_id("a"), 1);
    assert!(store.get(OUTBOX_KEY).unwrap().is_none());
    assert!(outbox.is_empty());
  }

  #[test]
  fn test_retain_and_replace_all() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let outbox = Outbox::load(Arc::clone(&store));
    for id in ["a", "b", "c"] {
      outbox.enqueue(submission(id));
    }

    outbox.retain(|entry| entry.id != "b");
    assert_eq!(persisted_ids(store.as_ref()), Some(vec!["a".to_string(), "c".to_string()]));

    let remaining = outbox.find("c");
    outbox.replace_all(remaining);
    assert_eq!(persisted_ids(store.as_ref()), Some(vec!["c".to_string()]));

    outbox.clear();
    assert_eq!(persisted_ids(store.as_ref()), None);
  }

  #[test]
  fn test_legacy_approvals_are_imported_once() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    write_json(
      store.as_ref(),
      LEGACY_APPROVAL_KEY,
      &json!([
        { "id": "55", "status": "aprobado", "message": "" },
        { "response_id": "56", "status": "rechazado", "message": "missing photo" },
        { "id": 57, "status": "aprobado", "timestamp": 1718000000000_i64 },
        { "responseId": "58", "status": "aprobado", "timestamp": "2024-06-10T06:13:20Z" }
      ]),
    )
    .unwrap();

    let outbox = Outbox::load(Arc::clone(&store));
    assert_eq!(outbox.len(), 4);
    assert!(store.get(LEGACY_APPROVAL_KEY).unwrap().is_none());

    let entry = &outbox.find("56")[0];
    match &entry.kind {
      OutboxKind::ApprovalDecision(decision) => {
        assert_eq!(decision.status, "rechazado");
        assert_eq!(decision.message, "missing photo");
      }
      other => panic!("unexpected kind {:?}", other),
    }

    let numeric = &outbox.find("57")[0];
    assert_eq!(numeric.created_at.timestamp_millis(), 1_718_000_000_000);
    let text = &outbox.find("58")[0];
    assert_eq!(text.created_at, numeric.created_at);

    // Reloading does not duplicate
    assert_eq!(Outbox::load(store).len(), 4);
  }

  #[test]
  fn test_legacy_key_kept_until_outbox_is_written() {
    let memory = Arc::new(MemoryStore::new());
    write_json(
      memory.as_ref(),
      LEGACY_APPROVAL_KEY,
      &json!([{ "id": "55", "status": "aprobado" }]),
    )
    .unwrap();

    let failing: Arc<dyn KeyValueStore> = Arc::new(RejectingStore {
      inner: Arc::clone(&memory),
      rejected_key: OUTBOX_KEY,
    });
    let outbox = Outbox::load(failing);
    assert_eq!(outbox.len(), 1);
    assert!(memory.get(LEGACY_APPROVAL_KEY).unwrap().is_some());
    assert!(memory.get(OUTBOX_KEY).unwrap().is_none());

    // Next start with a working store still finds the approval
    let restarted = Outbox::load(memory.clone());
    assert_eq!(restarted.len(), 1);
    assert!(memory.get(LEGACY_APPROVAL_KEY).unwrap().is_none());
    assert_eq!(persisted_ids(memory.as_ref()), Some(vec!["55".to_string()]));
  }

  #[test]
  fn test_undecodable_records_are_quarantined_not_dropped() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let unknown = json!({ "id": "c", "kind": { "type": "future_kind" } });
    let raw = json!([
      serde_json::to_value(submission("a")).unwrap(),
      serde_json::to_value(submission("b")).unwrap(),
      unknown.clone(),
    ]);
    write_json(store.as_ref(), OUTBOX_KEY, &raw).unwrap();

    let outbox = Outbox::load(Arc::clone(&store));
    assert_eq!(outbox.len(), 2);

    outbox.enqueue(submission("d"));
    assert_eq!(
      persisted_ids(store.as_ref()),
      Some(vec!["a".to_string(), "b".to_string(), "d".to_string()])
    );
    let quarantined: Vec<Value> = read_json(store.as_ref(), QUARANTINE_KEY).unwrap().unwrap();
    assert_eq!(quarantined, vec![unknown]);
  }

  #[test]
  fn test_queue_untouched_while_quarantine_cannot_be_written() {
    let memory = Arc::new(MemoryStore::new());
    let original = json!([
      serde_json::to_value(submission("a")).unwrap(),
      { "id": "c", "kind": { "type": "future_kind" } },
    ])
    .to_string();
    memory.set(OUTBOX_KEY, &original).unwrap();

    let failing: Arc<dyn KeyValueStore> = Arc::new(RejectingStore {
      inner: Arc::clone(&memory),
      rejected_key: QUARANTINE_KEY,
    });
    let outbox = Outbox::load(failing);
    outbox.enqueue(submission("d"));

    assert_eq!(outbox.len(), 2);
    assert_eq!(memory.get(OUTBOX_KEY).unwrap(), Some(original));
  }

  #[test]
  fn test_unparseable_queue_is_quarantined_whole() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store.set(OUTBOX_KEY, "[{\"broken\": tru").unwrap();

    let outbox = Outbox::load(Arc::clone(&store));
    assert!(outbox.is_empty());
    assert!(store.get(OUTBOX_KEY).unwrap().is_none());

    let quarantined: Vec<Value> = read_json(store.as_ref(), QUARANTINE_KEY).unwrap().unwrap();
    assert_eq!(quarantined, vec![json!("[{\"broken\": tru")]);
  }
}
