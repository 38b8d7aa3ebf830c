//! Forms backend: wire types, HTTP client and the cached catalog facade.

pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod error;
pub mod types;

pub use cached_client::CachedFormsClient;
pub use client::{FormsApi, HttpFormsClient};
pub use error::ApiError;
pub use types::{Answer, ApprovalDecision, Attachment, Category, Form, FormSubmission};
