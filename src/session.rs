//! Authentication session backed by the key-value store.
//!
//! Token issuance happens elsewhere; this module only stores the token,
//! hands it to outgoing requests and tears the session down when the
//! backend answers 401.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::store::KeyValueStore;

pub const AUTH_TOKEN_KEY: &str = "auth_token";
pub const LOGGED_OUT_KEY: &str = "logged_out";

/// Accessor for the bearer token attached to outgoing requests.
pub trait AuthProvider: Send + Sync {
  fn auth_token(&self) -> Option<String>;
}

/// Session lifecycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
  /// The backend rejected the token; the user must log in again.
  Expired,
}

#[derive(Clone)]
pub struct Session {
  store: Arc<dyn KeyValueStore>,
  events: broadcast::Sender<SessionEvent>,
}

impl Session {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    let (events, _) = broadcast::channel(16);
    Self { store, events }
  }

  /// Stored token, if any. Storage failures read as "no token".
  pub fn token(&self) -> Option<String> {
    match self.store.get(AUTH_TOKEN_KEY) {
      Ok(token) => token.filter(|t| !t.is_empty()),
      Err(e) => {
        error!(error = %e, "Failed to read auth token");
        None
      }
    }
  }

  pub fn set_token(&self, token: &str) {
    if let Err(e) = self.store.set(AUTH_TOKEN_KEY, token) {
      error!(error = %e, "Failed to store auth token");
    }
    if let Err(e) = self.store.remove(LOGGED_OUT_KEY) {
      error!(error = %e, "Failed to clear logged-out flag");
    }
  }

  /// Terminate the local session after a 401.
  pub fn invalidate(&self) {
    warn!("Session rejected by backend, clearing token");

    if let Err(e) = self.store.remove(AUTH_TOKEN_KEY) {
      error!(error = %e, "Failed to clear auth token");
    }
    if let Err(e) = self.store.set(LOGGED_OUT_KEY, "true") {
      error!(error = %e, "Failed to mark session logged out");
    }

    // No subscribers is fine
    let _ = self.events.send(SessionEvent::Expired);
  }

  pub fn is_logged_out(&self) -> bool {
    matches!(self.store.get(LOGGED_OUT_KEY), Ok(Some(flag)) if flag == "true")
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
    self.events.subscribe()
  }
}

impl AuthProvider for Session {
  fn auth_token(&self) -> Option<String> {
    self.token()
  }
}
