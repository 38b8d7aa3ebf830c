//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Trait for records that can be mirrored by a [`ReferenceCache`](super::ReferenceCache).
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Record type name for storage organization (e.g., "categories", "forms").
  ///
  /// Persisted under `{entity_type}_cache` and `{entity_type}_timestamp`.
  fn entity_type() -> &'static str;
}

/// Identifies one cached query.
pub trait QueryKey {
  /// Key under which the query's records are cached.
  fn cache_key(&self) -> String;

  /// Human readable description for logs.
  fn description(&self) -> String;
}

/// Options for a cache read.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
  /// Wait for an in-flight fetch of the same key instead of returning
  /// immediately with the best-known data.
  pub force_refresh: bool,
}

impl GetOptions {
  pub fn refresh() -> Self {
    Self {
      force_refresh: true,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was last fetched from the network, if known
  pub updated_at: Option<DateTime<Utc>>,
  /// Older than the cache TTL. Display metadata only.
  pub is_stale: bool,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      updated_at: Some(fetched_at),
      is_stale: false,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(
    data: T,
    source: CacheSource,
    updated_at: Option<DateTime<Utc>>,
    is_stale: bool,
  ) -> Self {
    Self {
      data,
      source,
      updated_at,
      is_stale,
    }
  }
}

impl<T: Default> CacheResult<T> {
  /// Nothing cached anywhere.
  pub fn empty() -> Self {
    Self {
      data: T::default(),
      source: CacheSource::Empty,
      updated_at: None,
      is_stale: true,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// In-memory entry
  Memory,
  /// Loaded from the persisted mirror
  Persisted,
  /// No data available
  Empty,
}
