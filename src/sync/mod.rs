//! Outbox replay: the submission protocol and the coordinator driving it.

mod coordinator;
mod protocol;
#[cfg(test)]
mod testing;

pub use coordinator::{DrainReport, SubmitOutcome, SyncCoordinator, SyncEvent, SyncState, LAST_SYNC_KEY};
pub use protocol::{ApprovalTimeouts, SubmissionProtocol};
