//! Serde types matching the forms backend's request and response bodies.
//!
//! These types are separate from domain types to allow lenient decoding
//! while keeping domain types focused on application needs.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;

use super::types::lenient_id;

/// Body of `POST /forms/{form_id}/responses`
#[derive(Debug, Serialize)]
pub struct CreateResponseRequest<'a> {
  pub form_id: &'a str,
  /// Lets a deduplicating backend drop replays of the same submission
  pub idempotency_key: &'a str,
}

/// Body of `POST /responses/{response_id}/answers`
#[derive(Debug, Serialize)]
pub struct SubmitAnswerRequest<'a> {
  pub question_id: &'a str,
  pub value: &'a serde_json::Value,
}

/// Body of `POST /answers/{answer_id}/file-serial`
#[derive(Debug, Serialize)]
pub struct FileSerialRequest<'a> {
  pub serial: &'a str,
}

/// Any endpoint answering with the id of the record it created
#[derive(Debug, Deserialize)]
pub struct ApiCreated {
  #[serde(deserialize_with = "lenient_id")]
  pub id: String,
}

/// Decode a listing response into records.
///
/// Anything that is not a JSON array yields an empty list; elements that do
/// not decode are skipped.
pub fn decode_records<T: DeserializeOwned>(value: serde_json::Value) -> Vec<T> {
  let serde_json::Value::Array(items) = value else {
    warn!("Listing response is not a sequence, treating as empty");
    return Vec::new();
  };

  let total = items.len();
  let records: Vec<T> = items
    .into_iter()
    .filter_map(|item| serde_json::from_value(item).ok())
    .collect();

  if records.len() < total {
    warn!(
      skipped = total - records.len(),
      "Dropped listing records that did not decode"
    );
  }

  records
}
