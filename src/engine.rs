//! Wires the store, session, connectivity, catalog cache and sync
//! coordinator together from a [`Config`].

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::forms::{CachedFormsClient, HttpFormsClient};
use crate::outbox::Outbox;
use crate::session::Session;
use crate::store::{KeyValueStore, MemoryStore, SqliteStore};
use crate::sync::{SubmissionProtocol, SyncCoordinator};

pub struct Engine {
  store: Arc<dyn KeyValueStore>,
  session: Session,
  connectivity: Connectivity,
  http: Arc<HttpFormsClient>,
  catalog: CachedFormsClient<HttpFormsClient>,
  coordinator: Arc<SyncCoordinator<HttpFormsClient>>,
  probe_interval: Option<std::time::Duration>,
}

impl Engine {
  /// Build the engine on the configured database.
  ///
  /// An unusable database degrades to an in-memory store so reads and
  /// submissions keep working for this run.
  pub fn new(config: &Config) -> Result<Self> {
    let opened = match &config.database {
      Some(path) => SqliteStore::open(path),
      None => SqliteStore::open_default(),
    };

    let store: Arc<dyn KeyValueStore> = match opened {
      Ok(store) => Arc::new(store),
      Err(e) => {
        error!(error = %e, "Failed to open database, falling back to memory");
        Arc::new(MemoryStore::new())
      }
    };

    Self::with_store(config, store)
  }

  pub fn with_store(config: &Config, store: Arc<dyn KeyValueStore>) -> Result<Self> {
    let session = Session::new(Arc::clone(&store));
    if session.token().is_none() {
      if let Some(token) = Config::get_api_token() {
        info!("Using token from environment");
        session.set_token(&token);
      }
    }

    let connectivity = Connectivity::new(None);

    let http = Arc::new(
      HttpFormsClient::new(
        &config.backend_url,
        Arc::new(session.clone()),
        config.http_timeout(),
      )
      .map_err(|e| eyre!("Failed to create backend client: {}", e))?,
    );

    let catalog = CachedFormsClient::new(
      Arc::clone(&http),
      Arc::clone(&store),
      connectivity.clone(),
      session.clone(),
      config.cache_settings(),
    );

    let coordinator = Arc::new(SyncCoordinator::new(
      Outbox::load(Arc::clone(&store)),
      SubmissionProtocol::new(Arc::clone(&http), config.approval_timeouts()),
      session.clone(),
      connectivity.clone(),
      Arc::clone(&store),
    ));

    Ok(Self {
      store,
      session,
      connectivity,
      http,
      catalog,
      coordinator,
      probe_interval: config.probe_interval(),
    })
  }

  /// Start background work: the reachability probe (if enabled) and the
  /// coordinator's reconnect loop.
  pub fn start(&self) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    if let Some(interval) = self.probe_interval {
      tasks.push(self.connectivity.spawn_probe(
        reqwest::Client::new(),
        self.http.base_url().clone(),
        interval,
      ));
    }
    tasks.push(self.coordinator.spawn());

    tasks
  }

  /// Write pending cache updates before shutdown.
  pub fn shutdown(&self) {
    self.catalog.flush();
  }

  pub fn store(&self) -> &Arc<dyn KeyValueStore> {
    &self.store
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn catalog(&self) -> &CachedFormsClient<HttpFormsClient> {
    &self.catalog
  }

  pub fn coordinator(&self) -> &Arc<SyncCoordinator<HttpFormsClient>> {
    &self.coordinator
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, GetOptions};
  use crate::forms::Answer;
  use crate::outbox::{OutboxEntry, OUTBOX_KEY};
  use crate::sync::SubmitOutcome;
  use serde_json::json;

  fn config() -> Config {
    serde_yaml::from_str("backend_url: http://127.0.0.1:9\nsync:\n  probe_interval_secs: 0\n")
      .unwrap()
  }

  #[tokio::test]
  async fn test_offline_engine_queues_and_serves_empty_catalog() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let engine = Engine::with_store(&config(), Arc::clone(&store)).unwrap();
    engine.connectivity().set_online(false);

    let entry = OutboxEntry::form_submission("17", vec![Answer::new("q1", json!("ok"))]);
    let outcome = engine.coordinator().submit(entry).await;
    assert_eq!(outcome, SubmitOutcome::Queued);
    assert!(store.get(OUTBOX_KEY).unwrap().is_some());

    let categories = engine.catalog().categories(None, GetOptions::default()).await;
    assert_eq!(categories.source, CacheSource::Empty);
    assert!(categories.data.is_empty());

    // A new engine on the same store sees the queued entry
    let restarted = Engine::with_store(&config(), store).unwrap();
    assert_eq!(restarted.coordinator().outbox().len(), 1);
  }

  #[test]
  fn test_invalid_backend_url_is_an_error() {
    let config: Config = serde_yaml::from_str("backend_url: \"not a url\"\n").unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    assert!(Engine::with_store(&config, store).is_err());
  }
}
