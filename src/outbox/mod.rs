//! Outbox of writes waiting for the backend.

mod entry;
mod queue;

pub use entry::{OutboxEntry, OutboxKind};
pub use queue::{Outbox, LEGACY_APPROVAL_KEY, OUTBOX_KEY, QUARANTINE_KEY};
