//! Deferred-sync: durable mutation queue and backend replay.

mod backend;
mod queue;

pub use backend::VaultBackend;
pub use queue::{
  DrainOutcome, FailedMutation, MutationBackend, Operation, QueuedMutation, SubmitError, SyncQueue,
};

/// Well-known trigger tag for the mutation-replay queue. Triggers carrying
/// any other tag are ignored.
pub const SYNC_TAG: &str = "sync-passwords";
