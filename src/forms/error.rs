use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the forms backend.
///
/// Only [`ApiError::Unauthorized`] is meant to escape the sync subsystem;
/// everything else is absorbed by cache fallback or outbox retention.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("session is no longer valid (HTTP 401)")]
  Unauthorized,

  #[error("{endpoint} returned HTTP {status}")]
  Status { endpoint: String, status: u16 },

  #[error("request to {endpoint} failed: {source}")]
  Transport {
    endpoint: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("could not decode response from {endpoint}: {source}")]
  Decode {
    endpoint: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("{endpoint} timed out after {}s", .after.as_secs())]
  Timeout { endpoint: String, after: Duration },

  #[error("could not read attachment {}: {source}", .path.display())]
  Attachment {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid backend url: {0}")]
  InvalidUrl(String),
}

impl ApiError {
  pub fn is_unauthorized(&self) -> bool {
    matches!(self, ApiError::Unauthorized)
  }
}
