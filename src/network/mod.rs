//! Network Module
//!
//! Calls from one replica node to another. Every call is async and
//! every transport failure surfaces as [`Error::PeerUnreachable`].
//!
//! [`Error::PeerUnreachable`]: crate::error::Error::PeerUnreachable

mod client;

pub use client::HttpPeerClient;

use crate::error::Result;
use crate::ledger::{Clock, UserExport};
use crate::replication::protocol::{HealthCheckResponse, SyncRequest, UserClockStatus};

/// Client for the peer-facing HTTP endpoints
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync {
    /// One export page; `None` when the peer has no state for the user
    async fn export(&self, endpoint: &str, user_key: &str, clock_range_min: Clock) -> Result<Option<UserExport>>;

    /// Raw content by hash
    async fn fetch_content(&self, endpoint: &str, hash: &str) -> Result<Vec<u8>>;

    /// Ask a peer to pull from a primary
    async fn request_sync(&self, endpoint: &str, request: &SyncRequest) -> Result<()>;

    /// Clocks for many users; unknown users report 0
    async fn batch_clock_status(&self, endpoint: &str, user_keys: &[String]) -> Result<Vec<UserClockStatus>>;

    /// Clock for one user
    async fn clock_status(&self, endpoint: &str, user_key: &str) -> Result<Clock>;

    /// Liveness and capacity probe
    async fn health_check(&self, endpoint: &str) -> Result<HealthCheckResponse>;
}
