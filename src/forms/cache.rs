//! Caching implementations for catalog types.

use crate::cache::{Cacheable, QueryKey};

use super::types::{Category, Form};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Category {
  fn entity_type() -> &'static str {
    "categories"
  }
}

impl Cacheable for Form {
  fn entity_type() -> &'static str {
    "forms"
  }
}

// ============================================================================
// Query key types
// ============================================================================

/// Query key types for catalog API calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormsQueryKey {
  /// Child categories of `parent`, or the root level
  Categories { parent: Option<String> },
  /// Forms inside a category
  Forms {
    category_id: String,
    include_subcategories: bool,
  },
}

impl QueryKey for FormsQueryKey {
  fn cache_key(&self) -> String {
    match self {
      Self::Categories { parent: None } => "root".to_string(),
      Self::Categories {
        parent: Some(parent),
      } => parent.clone(),
      Self::Forms {
        category_id,
        include_subcategories,
      } => format!("{}_{}", category_id, include_subcategories),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::Categories { parent: None } => "root categories".to_string(),
      Self::Categories {
        parent: Some(parent),
      } => format!("categories under {}", parent),
      Self::Forms {
        category_id,
        include_subcategories: true,
      } => format!("forms in category {} and subcategories", category_id),
      Self::Forms { category_id, .. } => format!("forms in category {}", category_id),
    }
  }
}
