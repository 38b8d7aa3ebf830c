//! Remote call sequences that realize one outbox entry.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::forms::{ApiError, ApprovalDecision, FormSubmission, FormsApi};
use crate::outbox::{OutboxEntry, OutboxKind};

/// Timeouts for the approval request, the only step with an explicit limit.
#[derive(Debug, Clone, Copy)]
pub struct ApprovalTimeouts {
  pub without_attachments: Duration,
  pub with_attachments: Duration,
}

impl Default for ApprovalTimeouts {
  fn default() -> Self {
    Self {
      without_attachments: Duration::from_secs(60),
      with_attachments: Duration::from_secs(180),
    }
  }
}

impl ApprovalTimeouts {
  fn for_decision(&self, decision: &ApprovalDecision) -> Duration {
    if decision.files.is_empty() {
      self.without_attachments
    } else {
      self.with_attachments
    }
  }
}

/// Executes entries against the backend. Shared by immediate submission and
/// outbox replay; every execution starts from the first step.
pub struct SubmissionProtocol<A: FormsApi> {
  api: Arc<A>,
  timeouts: ApprovalTimeouts,
}

impl<A: FormsApi> SubmissionProtocol<A> {
  pub fn new(api: Arc<A>, timeouts: ApprovalTimeouts) -> Self {
    Self { api, timeouts }
  }

  /// Run every step for `entry`. Any error means the entry must stay queued.
  pub async fn execute(&self, entry: &OutboxEntry) -> Result<(), ApiError> {
    match &entry.kind {
      OutboxKind::FormSubmission(submission) => {
        self
          .submit_form(submission, &entry.idempotency_key)
          .await
      }
      OutboxKind::ApprovalDecision(decision) => self.submit_approval(decision).await,
    }
  }

  async fn submit_form(&self, submission: &FormSubmission, idempotency_key: &str) -> Result<(), ApiError> {
    // 1. Parent record
    let response_id = self
      .api
      .create_response(&submission.form_id, idempotency_key)
      .await?;
    debug!(form_id = %submission.form_id, response_id, "Created response");

    // 2. Answers, one at a time to keep server-side order
    let mut answer_ids = Vec::with_capacity(submission.answers.len());
    for answer in &submission.answers {
      let answer_id = self.api.submit_answer(&response_id, answer).await?;
      answer_ids.push(answer_id);
    }

    // 3. File serials, best effort
    for (answer, answer_id) in submission.answers.iter().zip(&answer_ids) {
      let Some(serial) = answer.pending_serial() else {
        continue;
      };

      match self.api.associate_file_serial(answer_id, serial).await {
        Ok(()) => debug!(answer_id, serial, "Associated file serial"),
        Err(e) if e.is_unauthorized() => return Err(e),
        Err(e) => warn!(answer_id, serial, error = %e, "Could not associate file serial"),
      }
    }

    info!(
      form_id = %submission.form_id,
      response_id,
      answers = answer_ids.len(),
      "Form submitted"
    );
    Ok(())
  }

  async fn submit_approval(&self, decision: &ApprovalDecision) -> Result<(), ApiError> {
    let limit = self.timeouts.for_decision(decision);

    // Dropping the request future on timeout cancels it
    match tokio::time::timeout(limit, self.api.update_approval(decision)).await {
      Ok(result) => result?,
      Err(_) => {
        return Err(ApiError::Timeout {
          endpoint: "approval".to_string(),
          after: limit,
        })
      }
    }

    info!(
      response_id = %decision.response_id,
      status = %decision.status,
      attachments = decision.files.len(),
      "Approval decision sent"
    );
    Ok(())
  }
}
