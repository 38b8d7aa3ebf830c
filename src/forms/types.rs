use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Catalog category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
  #[serde(deserialize_with = "lenient_id")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default, deserialize_with = "lenient_opt_id")]
  pub parent_id: Option<String>,
  // Anything else the backend sends, kept for display
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Form definition listed inside a category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Form {
  #[serde(deserialize_with = "lenient_id")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default, deserialize_with = "lenient_opt_id")]
  pub category_id: Option<String>,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One answer of a form submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
  pub question_id: String,
  pub value: serde_json::Value,
  /// File-type question
  #[serde(default)]
  pub is_file: bool,
  /// Locally generated serial of the captured file
  #[serde(default)]
  pub file_serial: Option<String>,
}

impl Answer {
  pub fn new(question_id: impl Into<String>, value: serde_json::Value) -> Self {
    Self {
      question_id: question_id.into(),
      value,
      is_file: false,
      file_serial: None,
    }
  }

  pub fn file(
    question_id: impl Into<String>,
    value: serde_json::Value,
    serial: impl Into<String>,
  ) -> Self {
    Self {
      question_id: question_id.into(),
      value,
      is_file: true,
      file_serial: Some(serial.into()),
    }
  }

  /// Serial to associate once the server has assigned an answer id.
  pub fn pending_serial(&self) -> Option<&str> {
    if self.is_file {
      self.file_serial.as_deref()
    } else {
      None
    }
  }
}

/// Local file attached to an approval decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
  pub path: PathBuf,
  pub file_name: String,
  #[serde(default)]
  pub mime: Option<String>,
}

/// Approval or rejection of a submitted response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
  pub response_id: String,
  pub status: String, // e.g. "aprobado", "rechazado"
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub files: Vec<Attachment>,
}

/// Form submission: answers for one form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSubmission {
  pub form_id: String,
  pub answers: Vec<Answer>,
}

/// Accept ids sent either as JSON numbers or strings.
pub(crate) fn lenient_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum RawId {
    Text(String),
    Number(serde_json::Number),
  }

  Ok(match RawId::deserialize(deserializer)? {
    RawId::Text(s) => s,
    RawId::Number(n) => n.to_string(),
  })
}

fn lenient_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  struct Wrapper(#[serde(deserialize_with = "lenient_id")] String);

  Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(id)| id))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_category_accepts_numeric_and_string_ids() {
    let numeric: Category =
      serde_json::from_value(json!({ "id": 42, "name": "Safety", "parent_id": 7 })).unwrap();
    assert_eq!(numeric.id, "42");
    assert_eq!(numeric.parent_id.as_deref(), Some("7"));

    let text: Category =
      serde_json::from_value(json!({ "id": "a1", "name": "Audit", "icon": "clip" })).unwrap();
    assert_eq!(text.id, "a1");
    assert_eq!(text.parent_id, None);
    assert_eq!(text.extra.get("icon"), Some(&json!("clip")));
  }

  #[test]
  fn test_pending_serial_requires_file_flag() {
    let mut answer = Answer::file("q1", json!("photo.jpg"), "SER-1");
    assert_eq!(answer.pending_serial(), Some("SER-1"));

    answer.is_file = false;
    assert_eq!(answer.pending_serial(), None);
  }
}
