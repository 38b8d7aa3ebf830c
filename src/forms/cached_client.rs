//! Cached forms client that wraps a [`FormsApi`] with transparent caching.

use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheResult, CacheSettings, GetOptions, QueryKey, ReferenceCache};
use crate::connectivity::Connectivity;
use crate::session::Session;
use crate::store::KeyValueStore;

use super::api_types::decode_records;
use super::cache::FormsQueryKey;
use super::client::FormsApi;
use super::error::ApiError;
use super::types::{Category, Form};

/// Forms client with transparent caching support.
///
/// Reads go through one [`ReferenceCache`] per record type and never fail.
/// A 401 from a listing call ends the session before the cache falls back.
pub struct CachedFormsClient<A: FormsApi> {
  inner: Arc<A>,
  session: Session,
  categories: ReferenceCache<Category>,
  forms: ReferenceCache<Form>,
}

impl<A: FormsApi> CachedFormsClient<A> {
  pub fn new(
    inner: Arc<A>,
    store: Arc<dyn KeyValueStore>,
    connectivity: Connectivity,
    session: Session,
    settings: CacheSettings,
  ) -> Self {
    Self {
      inner,
      session,
      categories: ReferenceCache::new(Arc::clone(&store), connectivity.clone(), settings),
      forms: ReferenceCache::new(store, connectivity, settings),
    }
  }

  /// Child categories of `parent` (root level when `None`).
  pub async fn categories(
    &self,
    parent: Option<&str>,
    options: GetOptions,
  ) -> CacheResult<Vec<Category>> {
    let query_key = FormsQueryKey::Categories {
      parent: parent.map(String::from),
    };

    let description = query_key.description();

    self
      .categories
      .get(&query_key.cache_key(), options, move || async move {
        debug!(query = %description, "Fetching from backend");
        let listing = self.inner.list_categories(parent).await;
        self.check_session(listing).map(decode_records)
      })
      .await
  }

  /// Forms in `category_id`, optionally including its subcategories.
  pub async fn forms(
    &self,
    category_id: &str,
    include_subcategories: bool,
    options: GetOptions,
  ) -> CacheResult<Vec<Form>> {
    let query_key = FormsQueryKey::Forms {
      category_id: category_id.to_string(),
      include_subcategories,
    };

    let description = query_key.description();

    self
      .forms
      .get(&query_key.cache_key(), options, move || async move {
        debug!(query = %description, "Fetching from backend");
        let listing = self
          .inner
          .list_forms(category_id, include_subcategories)
          .await;
        self.check_session(listing).map(decode_records)
      })
      .await
  }

  /// Write pending cache updates now.
  pub fn flush(&self) {
    self.categories.flush();
    self.forms.flush();
  }

  pub fn category_cache(&self) -> &ReferenceCache<Category> {
    &self.categories
  }

  pub fn form_cache(&self) -> &ReferenceCache<Form> {
    &self.forms
  }

  fn check_session<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
    if let Err(e) = &result {
      if e.is_unauthorized() {
        self.session.invalidate();
      }
    }
    result
  }
}

impl<A: FormsApi> Clone for CachedFormsClient<A> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      session: self.session.clone(),
      categories: self.categories.clone(),
      forms: self.forms.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::forms::types::{Answer, ApprovalDecision};
  use crate::store::MemoryStore;
  use futures::future::{BoxFuture, FutureExt};
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicUsize, Ordering};

  /// Serves fixed listings; everything else is unused here.
  struct CatalogApi {
    categories: Value,
    unauthorized: bool,
    calls: AtomicUsize,
  }

  impl FormsApi for CatalogApi {
    fn list_categories<'a>(&'a self, _parent: Option<&'a str>) -> BoxFuture<'a, Result<Value, ApiError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let result = if self.unauthorized {
        Err(ApiError::Unauthorized)
      } else {
        Ok(self.categories.clone())
      };
      async move { result }.boxed()
    }

    fn list_forms<'a>(&'a self, category_id: &'a str, _include: bool) -> BoxFuture<'a, Result<Value, ApiError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let forms = json!([{ "id": 1, "name": "Inspection", "category_id": category_id }]);
      async move { Ok(forms) }.boxed()
    }

    fn create_response<'a>(&'a self, _form_id: &'a str, _key: &'a str) -> BoxFuture<'a, Result<String, ApiError>> {
      async { Ok("r".to_string()) }.boxed()
    }

    fn submit_answer<'a>(&'a self, _response_id: &'a str, _answer: &'a Answer) -> BoxFuture<'a, Result<String, ApiError>> {
      async { Ok("a".to_string()) }.boxed()
    }

    fn associate_file_serial<'a>(&'a self, _answer_id: &'a str, _serial: &'a str) -> BoxFuture<'a, Result<(), ApiError>> {
      async { Ok(()) }.boxed()
    }

    fn update_approval<'a>(&'a self, _decision: &'a ApprovalDecision) -> BoxFuture<'a, Result<(), ApiError>> {
      async { Ok(()) }.boxed()
    }
  }

  fn client(api: CatalogApi, online: bool) -> (CachedFormsClient<CatalogApi>, Session, Arc<CatalogApi>) {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let session = Session::new(Arc::clone(&store));
    session.set_token("token");
    let api = Arc::new(api);
    let client = CachedFormsClient::new(
      Arc::clone(&api),
      store,
      Connectivity::new(Some(online)),
      session.clone(),
      CacheSettings::default(),
    );
    (client, session, api)
  }

  #[tokio::test]
  async fn test_categories_decode_and_cache() {
    let (client, _session, api) = client(
      CatalogApi {
        categories: json!([{ "id": 1, "name": "Safety" }, { "id": 2, "name": "Quality" }]),
        unauthorized: false,
        calls: AtomicUsize::new(0),
      },
      true,
    );

    let result = client.categories(None, GetOptions::default()).await;
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.len(), 2);
    assert_eq!(result.data[0].name, "Safety");

    let cached = client.category_cache().best_known("root");
    assert_eq!(cached.data, result.data);
    assert_eq!(api.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_unexpected_shape_is_empty() {
    let (client, _session, _api) = client(
      CatalogApi {
        categories: json!({ "error": "oops" }),
        unauthorized: false,
        calls: AtomicUsize::new(0),
      },
      true,
    );

    let result = client.categories(Some("5"), GetOptions::default()).await;
    assert!(result.data.is_empty());
    assert_eq!(result.source, CacheSource::Network);
  }

  #[tokio::test]
  async fn test_unauthorized_listing_ends_session() {
    let (client, session, _api) = client(
      CatalogApi {
        categories: json!([]),
        unauthorized: true,
        calls: AtomicUsize::new(0),
      },
      true,
    );

    let result = client.categories(None, GetOptions::default()).await;
    assert_eq!(result.source, CacheSource::Empty);
    assert_eq!(session.token(), None);
    assert!(session.is_logged_out());
  }

  #[tokio::test]
  async fn test_forms_keyed_by_category_and_flag() {
    let (client, _session, api) = client(
      CatalogApi {
        categories: json!([]),
        unauthorized: false,
        calls: AtomicUsize::new(0),
      },
      true,
    );

    let result = client.forms("42", false, GetOptions::default()).await;
    assert_eq!(result.data[0].category_id.as_deref(), Some("42"));
    assert_eq!(client.form_cache().best_known("42_false").data.len(), 1);
    assert_eq!(client.form_cache().best_known("42_true").source, CacheSource::Empty);
    assert_eq!(api.calls.load(Ordering::SeqCst), 1);
  }
}
