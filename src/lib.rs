//! Offline-first sync for form catalogs, form submissions and approval
//! decisions.
//!
//! Reads go through [`cache::ReferenceCache`] and never fail; writes go
//! through [`sync::SyncCoordinator`], which queues them in the
//! [`outbox::Outbox`] while the backend is unreachable.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod forms;
pub mod outbox;
pub mod session;
pub mod store;
pub mod sync;

pub use engine::Engine;
