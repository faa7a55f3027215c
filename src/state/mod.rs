//! State Management Module
//!
//! Process-local bookkeeping shared by the sync workers and the state
//! machine: queued-job deduplication, sync history, per-user failure
//! counts and peer health classification.

mod dedup;
mod failures;
pub mod health;
mod history;

pub use dedup::{Enqueued, JobHandle, SyncDeduplicator, SyncKey};
pub use failures::UserSyncFailureCounter;
pub use health::{PeerHealth, PeerHealthEvaluator};
pub use history::{SyncCounts, SyncHistoryAggregator, SyncHistorySnapshot, SyncOutcome};
