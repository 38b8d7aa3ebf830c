use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::forms::{Answer, ApprovalDecision, FormSubmission};

/// A write that has not been confirmed by the backend yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
  /// Subject of the mutation: form id for submissions, response id for approvals
  pub id: String,
  pub kind: OutboxKind,
  pub created_at: DateTime<Utc>,
  /// Client-generated token sent with the parent-record creation call
  pub idempotency_key: String,
  /// Identity of this queued write; entries written before it existed get a fresh one on load
  #[serde(default = "Uuid::new_v4")]
  pub uid: Uuid,
}

/// What the entry replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboxKind {
  FormSubmission(FormSubmission),
  ApprovalDecision(ApprovalDecision),
}

impl OutboxKind {
  pub fn label(&self) -> &'static str {
    match self {
      OutboxKind::FormSubmission(_) => "form_submission",
      OutboxKind::ApprovalDecision(_) => "approval_decision",
    }
  }

  fn subject_id(&self) -> &str {
    match self {
      OutboxKind::FormSubmission(submission) => &submission.form_id,
      OutboxKind::ApprovalDecision(decision) => &decision.response_id,
    }
  }
}

impl OutboxEntry {
  pub fn new(kind: OutboxKind) -> Self {
    Self::with_created_at(kind, Utc::now())
  }

  pub fn with_created_at(kind: OutboxKind, created_at: DateTime<Utc>) -> Self {
    let id = kind.subject_id().to_string();
    let uid = Uuid::new_v4();
    let idempotency_key = idempotency_key(&id, kind.label(), created_at, uid);

    Self {
      id,
      kind,
      created_at,
      idempotency_key,
      uid,
    }
  }

  pub fn form_submission(form_id: impl Into<String>, answers: Vec<Answer>) -> Self {
    Self::new(OutboxKind::FormSubmission(FormSubmission {
      form_id: form_id.into(),
      answers,
    }))
  }

  pub fn approval_decision(decision: ApprovalDecision) -> Self {
    Self::new(OutboxKind::ApprovalDecision(decision))
  }

  pub fn label(&self) -> &'static str {
    self.kind.label()
  }
}

/// SHA-256 over subject, kind, creation instant and entry uid, hex encoded.
fn idempotency_key(id: &str, label: &str, created_at: DateTime<Utc>, uid: Uuid) -> String {
  let mut hasher = Sha256::new();
  hasher.update(id.as_bytes());
  hasher.update(b"\0");
  hasher.update(label.as_bytes());
  hasher.update(b"\0");
  hasher.update(
    created_at
      .timestamp_nanos_opt()
      .unwrap_or_else(|| created_at.timestamp_micros())
      .to_be_bytes(),
  );
  hasher.update(b"\0");
  hasher.update(uid.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_entry_serializes_with_kind_tag() {
    let entry = OutboxEntry::form_submission("17", vec![Answer::new("q1", json!("yes"))]);
    let value = serde_json::to_value(&entry).unwrap();

    assert_eq!(value["id"], json!("17"));
    assert_eq!(value["kind"]["type"], json!("form_submission"));
    assert_eq!(value["kind"]["answers"][0]["question_id"], json!("q1"));

    let back: OutboxEntry = serde_json::from_value(value).unwrap();
    assert_eq!(back, entry);
  }

  #[test]
  fn test_entries_created_at_same_instant_stay_distinct() {
    let at = Utc::now();
    let kind = OutboxKind::FormSubmission(FormSubmission {
      form_id: "17".to_string(),
      answers: Vec::new(),
    });

    let a = OutboxEntry::with_created_at(kind.clone(), at);
    let b = OutboxEntry::with_created_at(kind, at);

    assert_ne!(a.uid, b.uid);
    assert_ne!(a.idempotency_key, b.idempotency_key);
    assert_eq!(a.idempotency_key.len(), 64);

    // The key survives persistence unchanged
    let back: OutboxEntry = serde_json::from_value(serde_json::to_value(&a).unwrap()).unwrap();
    assert_eq!(back.idempotency_key, a.idempotency_key);
    assert_eq!(back.uid, a.uid);
  }

  #[test]
  fn test_entry_without_uid_gets_one_on_load() {
    let value = json!({
      "id": "55",
      "kind": { "type": "approval_decision", "response_id": "55", "status": "aprobado" },
      "created_at": "2024-06-10T06:13:20Z",
      "idempotency_key": "abc"
    });

    let entry: OutboxEntry = serde_json::from_value(value).unwrap();
    assert_eq!(entry.idempotency_key, "abc");
    assert!(!entry.uid.is_nil());
  }
}
