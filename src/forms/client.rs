use futures::future::{BoxFuture, FutureExt};
use reqwest::multipart;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::session::AuthProvider;

use super::api_types::{ApiCreated, CreateResponseRequest, FileSerialRequest, SubmitAnswerRequest};
use super::error::ApiError;
use super::types::{Answer, ApprovalDecision};

/// Remote operations the sync subsystem depends on.
///
/// Listing calls return the raw JSON body; shape checking happens in the
/// caching layer so malformed listings degrade to empty results.
pub trait FormsApi: Send + Sync {
  /// Categories under `parent`, or the root categories.
  fn list_categories<'a>(&'a self, parent: Option<&'a str>) -> BoxFuture<'a, Result<Value, ApiError>>;

  /// Forms inside a category.
  fn list_forms<'a>(
    &'a self,
    category_id: &'a str,
    include_subcategories: bool,
  ) -> BoxFuture<'a, Result<Value, ApiError>>;

  /// Create the parent response record. Returns the server-assigned id.
  fn create_response<'a>(
    &'a self,
    form_id: &'a str,
    idempotency_key: &'a str,
  ) -> BoxFuture<'a, Result<String, ApiError>>;

  /// Submit one answer. Returns the server-assigned answer id.
  fn submit_answer<'a>(
    &'a self,
    response_id: &'a str,
    answer: &'a Answer,
  ) -> BoxFuture<'a, Result<String, ApiError>>;

  /// Link a locally generated file serial to a stored answer.
  fn associate_file_serial<'a>(
    &'a self,
    answer_id: &'a str,
    serial: &'a str,
  ) -> BoxFuture<'a, Result<(), ApiError>>;

  /// Send an approval decision with its attachments.
  fn update_approval<'a>(&'a self, decision: &'a ApprovalDecision) -> BoxFuture<'a, Result<(), ApiError>>;
}

/// HTTP implementation of [`FormsApi`]
#[derive(Clone)]
pub struct HttpFormsClient {
  http: reqwest::Client,
  base: Url,
  auth: Arc<dyn AuthProvider>,
}

impl HttpFormsClient {
  pub fn new(base_url: &str, auth: Arc<dyn AuthProvider>, timeout: Duration) -> Result<Self, ApiError> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|source| ApiError::Transport {
        endpoint: "client".to_string(),
        source,
      })?;

    Self::with_client(http, base_url, auth)
  }

  pub fn with_client(
    http: reqwest::Client,
    base_url: &str,
    auth: Arc<dyn AuthProvider>,
  ) -> Result<Self, ApiError> {
    Ok(Self {
      http,
      base: parse_base_url(base_url)?,
      auth,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  /// Build `{base}/{segments...}`.
  fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  /// Attach the bearer token, send, and map 401/non-2xx to errors.
  async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<Response, ApiError> {
    let request = match self.auth.auth_token() {
      Some(token) => request.bearer_auth(token),
      None => request,
    };

    debug!(endpoint, "Sending request");

    let response = request.send().await.map_err(|source| ApiError::Transport {
      endpoint: endpoint.to_string(),
      source,
    })?;

    check_status(endpoint, response.status())?;
    Ok(response)
  }

  async fn get_json(&self, endpoint: &str, url: Url) -> Result<Value, ApiError> {
    let response = self.send(endpoint, self.http.get(url)).await?;
    read_json(endpoint, response).await
  }

  async fn post_created<B: serde::Serialize>(
    &self,
    endpoint: &str,
    url: Url,
    body: &B,
  ) -> Result<String, ApiError> {
    let response = self.send(endpoint, self.http.post(url).json(body)).await?;
    let value = read_json(endpoint, response).await?;
    let created: ApiCreated = serde_json::from_value(value).map_err(|source| ApiError::Decode {
      endpoint: endpoint.to_string(),
      source,
    })?;
    Ok(created.id)
  }

  async fn approval_form(decision: &ApprovalDecision) -> Result<multipart::Form, ApiError> {
    let mut form = multipart::Form::new()
      .text("status", decision.status.clone())
      .text("message", decision.message.clone());

    for attachment in &decision.files {
      let bytes = tokio::fs::read(&attachment.path)
        .await
        .map_err(|source| ApiError::Attachment {
          path: attachment.path.clone(),
          source,
        })?;

      let mut part = multipart::Part::bytes(bytes).file_name(attachment.file_name.clone());
      if let Some(mime) = &attachment.mime {
        part = part
          .mime_str(mime)
          .map_err(|source| ApiError::Transport {
            endpoint: "approval".to_string(),
            source,
          })?;
      }
      form = form.part("files", part);
    }

    Ok(form)
  }
}

impl FormsApi for HttpFormsClient {
  fn list_categories<'a>(&'a self, parent: Option<&'a str>) -> BoxFuture<'a, Result<Value, ApiError>> {
    async move {
      let mut url = self.endpoint(&["categories"])?;
      if let Some(parent) = parent {
        url.query_pairs_mut().append_pair("parent_id", parent);
      }
      self.get_json("categories", url).await
    }
    .boxed()
  }

  fn list_forms<'a>(
    &'a self,
    category_id: &'a str,
    include_subcategories: bool,
  ) -> BoxFuture<'a, Result<Value, ApiError>> {
    async move {
      let mut url = self.endpoint(&["categories", category_id, "forms"])?;
      url
        .query_pairs_mut()
        .append_pair("include_subcategories", &include_subcategories.to_string());
      self.get_json("forms", url).await
    }
    .boxed()
  }

  fn create_response<'a>(
    &'a self,
    form_id: &'a str,
    idempotency_key: &'a str,
  ) -> BoxFuture<'a, Result<String, ApiError>> {
    async move {
      let url = self.endpoint(&["forms", form_id, "responses"])?;
      let body = CreateResponseRequest {
        form_id,
        idempotency_key,
      };
      self.post_created("create_response", url, &body).await
    }
    .boxed()
  }

  fn submit_answer<'a>(
    &'a self,
    response_id: &'a str,
    answer: &'a Answer,
  ) -> BoxFuture<'a, Result<String, ApiError>> {
    async move {
      let url = self.endpoint(&["responses", response_id, "answers"])?;
      let body = SubmitAnswerRequest {
        question_id: &answer.question_id,
        value: &answer.value,
      };
      self.post_created("submit_answer", url, &body).await
    }
    .boxed()
  }

  fn associate_file_serial<'a>(
    &'a self,
    answer_id: &'a str,
    serial: &'a str,
  ) -> BoxFuture<'a, Result<(), ApiError>> {
    async move {
      let url = self.endpoint(&["answers", answer_id, "file-serial"])?;
      let body = FileSerialRequest { serial };
      self
        .send("file_serial", self.http.post(url).json(&body))
        .await?;
      Ok(())
    }
    .boxed()
  }

  fn update_approval<'a>(&'a self, decision: &'a ApprovalDecision) -> BoxFuture<'a, Result<(), ApiError>> {
    async move {
      let url = self.endpoint(&["responses", decision.response_id.as_str(), "approval"])?;
      let form = Self::approval_form(decision).await?;
      self
        .send("approval", self.http.put(url).multipart(form))
        .await?;
      Ok(())
    }
    .boxed()
  }
}

/// Validate the configured backend base URL.
pub fn parse_base_url(base_url: &str) -> Result<Url, ApiError> {
  let trimmed = base_url.trim();
  if trimmed.is_empty() {
    return Err(ApiError::InvalidUrl("backend base url is not set".to_string()));
  }

  let url = Url::parse(trimmed).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", trimmed, e)))?;
  if url.cannot_be_a_base() {
    return Err(ApiError::InvalidUrl(trimmed.to_string()));
  }
  Ok(url)
}

/// 401 is the session-invalid signal; any other non-2xx is a plain failure.
fn check_status(endpoint: &str, status: StatusCode) -> Result<(), ApiError> {
  if status == StatusCode::UNAUTHORIZED {
    return Err(ApiError::Unauthorized);
  }
  if !status.is_success() {
    return Err(ApiError::Status {
      endpoint: endpoint.to_string(),
      status: status.as_u16(),
    });
  }
  Ok(())
}

async fn read_json(endpoint: &str, response: Response) -> Result<Value, ApiError> {
  let bytes = response.bytes().await.map_err(|source| ApiError::Transport {
    endpoint: endpoint.to_string(),
    source,
  })?;

  serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode {
    endpoint: endpoint.to_string(),
    source,
  })
}
