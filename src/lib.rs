//! WolfReplica - Clock-Based User Data Replication
//!
//! Every user's data lives on a replica set of three content nodes: one
//! primary and two secondaries. Each mutation appends a record at the
//! user's next clock value, and replication moves history between nodes
//! by comparing and exporting clock ranges.
//!
//! # Architecture
//!
//! - Secondaries pull pages of history from the primary, fetching any
//!   referenced content before persisting a page atomically.
//! - A primary that falls behind merges a secondary's extra records by
//!   rebasing them onto its own clock.
//! - A periodic state machine walks one slice of users per run, queues
//!   syncs for lagging secondaries and replaces unhealthy replicas.
//!
//! # Features
//!
//! - Per-user clock ledger with bounded range exports
//! - Content-addressed storage with hash verification
//! - Deduplicated manual and recurring sync queues with bounded concurrency
//! - Peer health evaluation from memory and sync history
//! - HTTP API for peers and operators

pub mod api;
pub mod config;
pub mod content;
pub mod error;
pub mod ledger;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod registry;
pub mod replication;
pub mod state;

#[cfg(test)]
mod testing;

pub use config::ReplicaConfig;
pub use error::{Error, Result};
pub use node::Node;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ReplicaConfig;
    pub use crate::content::{ContentStore, FsContentStore};
    pub use crate::error::{Error, Result};
    pub use crate::ledger::{Clock, ClockLedger, NewRecord, Record, SourceTable};
    pub use crate::network::{HttpPeerClient, PeerClient};
    pub use crate::node::Node;
    pub use crate::registry::{LocalRegistry, ReplicaSet, ReplicaSetRegistry};
    pub use crate::replication::{SyncRequest, SyncType};
}
