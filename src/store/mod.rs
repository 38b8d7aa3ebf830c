//! Durable key-value storage shared by the cache, the outbox and the session.
//!
//! Every persisted piece of state lives under a single string key holding a
//! JSON document. Components own their keys by convention; the store itself
//! imposes no locking discipline beyond per-call atomicity.

mod sqlite;

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

pub use sqlite::SqliteStore;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("could not (de)serialize value for key '{key}': {source}")]
  Serde {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("storage lock poisoned")]
  Poisoned,
}

/// Trait for persisted string-keyed storage backends.
pub trait KeyValueStore: Send + Sync {
  /// Read the raw value stored under `key`.
  fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

  /// Replace the value stored under `key`.
  fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

  /// Delete `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Read and decode a JSON document stored under `key`.
pub fn read_json<T: DeserializeOwned>(
  store: &dyn KeyValueStore,
  key: &str,
) -> Result<Option<T>, StoreError> {
  match store.get(key)? {
    Some(raw) => serde_json::from_str(&raw)
      .map(Some)
      .map_err(|source| StoreError::Serde {
        key: key.to_string(),
        source,
      }),
    None => Ok(None),
  }
}

/// Encode `value` as JSON and store it under `key`.
pub fn write_json<T: Serialize + ?Sized>(
  store: &dyn KeyValueStore,
  key: &str,
  value: &T,
) -> Result<(), StoreError> {
  let raw = serde_json::to_string(value).map_err(|source| StoreError::Serde {
    key: key.to_string(),
    source,
  })?;
  store.set(key, &raw)
}

/// Volatile storage, used in tests and as the fallback when the database
/// cannot be opened.
#[derive(Debug, Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
    Ok(values.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
    let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StoreError> {
    let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
    values.remove(key);
    Ok(())
  }
}
