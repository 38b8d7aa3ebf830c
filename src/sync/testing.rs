//! In-process [`FormsApi`] fake for protocol and coordinator tests.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::forms::{Answer, ApiError, ApprovalDecision, FormsApi};

type CreateHook = Box<dyn Fn(&str) -> Result<(), ApiError> + Send + Sync>;

/// Records every call as a short label and fails on request.
///
/// Response ids are `resp-{form_id}-{n}`, answer ids `ans-{question_id}`.
#[derive(Default)]
pub struct ScriptedApi {
  calls: Mutex<Vec<String>>,
  idempotency_keys: Mutex<Vec<String>>,
  failing_forms: Mutex<HashSet<String>>,
  unauthorized_step: Mutex<Option<&'static str>>,
  serials_fail: Mutex<bool>,
  approval_delay: Mutex<Option<Duration>>,
  create_hook: Mutex<Option<CreateHook>>,
  responses: AtomicUsize,
}

impl ScriptedApi {
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn idempotency_keys(&self) -> Vec<String> {
    self.idempotency_keys.lock().unwrap().clone()
  }

  pub fn count(&self, prefix: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|call| call.starts_with(prefix))
      .count()
  }

  /// Answer submission fails for responses created for `form_id`.
  pub fn fail_answers_for(&self, form_id: &str) {
    self.failing_forms.lock().unwrap().insert(form_id.to_string());
  }

  pub fn heal(&self) {
    self.failing_forms.lock().unwrap().clear();
    *self.unauthorized_step.lock().unwrap() = None;
  }

  /// Every call of `step` ("create", "answer", "serial", "approval") answers 401.
  pub fn unauthorized_on(&self, step: &'static str) {
    *self.unauthorized_step.lock().unwrap() = Some(step);
  }

  pub fn fail_serials(&self) {
    *self.serials_fail.lock().unwrap() = true;
  }

  pub fn delay_approvals(&self, delay: Duration) {
    *self.approval_delay.lock().unwrap() = Some(delay);
  }

  /// Run `hook` inside every `create_response` call; its error fails the call.
  pub fn on_create<F>(&self, hook: F)
  where
    F: Fn(&str) -> Result<(), ApiError> + Send + Sync + 'static,
  {
    *self.create_hook.lock().unwrap() = Some(Box::new(hook));
  }

  fn record(&self, step: &'static str, call: String) -> Result<(), ApiError> {
    self.calls.lock().unwrap().push(call);
    if *self.unauthorized_step.lock().unwrap() == Some(step) {
      return Err(ApiError::Unauthorized);
    }
    Ok(())
  }

  fn server_error(endpoint: &str) -> ApiError {
    ApiError::Status {
      endpoint: endpoint.to_string(),
      status: 500,
    }
  }
}

impl FormsApi for ScriptedApi {
  fn list_categories<'a>(&'a self, _parent: Option<&'a str>) -> BoxFuture<'a, Result<Value, ApiError>> {
    async { Ok(Value::Array(Vec::new())) }.boxed()
  }

  fn list_forms<'a>(&'a self, _category_id: &'a str, _include: bool) -> BoxFuture<'a, Result<Value, ApiError>> {
    async { Ok(Value::Array(Vec::new())) }.boxed()
  }

  fn create_response<'a>(
    &'a self,
    form_id: &'a str,
    idempotency_key: &'a str,
  ) -> BoxFuture<'a, Result<String, ApiError>> {
    async move {
      self.record("create", format!("create:{}", form_id))?;
      if let Some(hook) = self.create_hook.lock().unwrap().as_ref() {
        hook(form_id)?;
      }
      self
        .idempotency_keys
        .lock()
        .unwrap()
        .push(idempotency_key.to_string());
      let n = self.responses.fetch_add(1, Ordering::SeqCst) + 1;
      Ok(format!("resp-{}-{}", form_id, n))
    }
    .boxed()
  }

  fn submit_answer<'a>(&'a self, response_id: &'a str, answer: &'a Answer) -> BoxFuture<'a, Result<String, ApiError>> {
    async move {
      self.record(
        "answer",
        format!("answer:{}:{}", response_id, answer.question_id),
      )?;
      let failing = self
        .failing_forms
        .lock()
        .unwrap()
        .iter()
        .any(|form| response_id.starts_with(&format!("resp-{}-", form)));
      if failing {
        return Err(Self::server_error("submit_answer"));
      }
      Ok(format!("ans-{}", answer.question_id))
    }
    .boxed()
  }

  fn associate_file_serial<'a>(&'a self, answer_id: &'a str, serial: &'a str) -> BoxFuture<'a, Result<(), ApiError>> {
    async move {
      self.record("serial", format!("serial:{}:{}", answer_id, serial))?;
      if *self.serials_fail.lock().unwrap() {
        return Err(Self::server_error("file_serial"));
      }
      Ok(())
    }
    .boxed()
  }

  fn update_approval<'a>(&'a self, decision: &'a ApprovalDecision) -> BoxFuture<'a, Result<(), ApiError>> {
    async move {
      let delay = *self.approval_delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      self.record(
        "approval",
        format!("approval:{}:{}", decision.response_id, decision.status),
      )
    }
    .boxed()
  }
}
