//! Replica Set Registry
//!
//! The authoritative `{primary, secondary1, secondary2}` assignment per
//! user. Reconfiguration is the only writer during normal operation.

mod local;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use local::LocalRegistry;

/// Nodes holding copies of one user's data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub primary: String,
    pub secondary1: String,
    pub secondary2: String,
}

impl ReplicaSet {
    pub fn new(primary: impl Into<String>, secondary1: impl Into<String>, secondary2: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary1: secondary1.into(),
            secondary2: secondary2.into(),
        }
    }

    pub fn secondaries(&self) -> [&str; 2] {
        [&self.secondary1, &self.secondary2]
    }

    pub fn members(&self) -> [&str; 3] {
        [&self.primary, &self.secondary1, &self.secondary2]
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.members().contains(&endpoint)
    }

    pub fn is_primary(&self, endpoint: &str) -> bool {
        self.primary == endpoint
    }

    /// Copy with `old` replaced by `new` in the same slot
    pub fn replace(&self, old: &str, new: &str) -> ReplicaSet {
        let swap = |slot: &String| {
            if slot == old {
                new.to_string()
            } else {
                slot.clone()
            }
        };
        ReplicaSet {
            primary: swap(&self.primary),
            secondary1: swap(&self.secondary1),
            secondary2: swap(&self.secondary2),
        }
    }
}

impl std::fmt::Display for ReplicaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.primary, self.secondary1, self.secondary2)
    }
}

/// A user and its current assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAssignment {
    pub user_key: String,
    /// Numeric id used for slicing
    pub user_id: u64,
    pub replica_set: ReplicaSet,
}

/// Registry client used to read and write replica set assignments
#[async_trait::async_trait]
pub trait ReplicaSetRegistry: Send + Sync {
    /// Current assignment for a user
    async fn get_replica_set(&self, user_key: &str) -> Result<Option<UserAssignment>>;

    /// Overwrite the assignment for an existing user
    async fn set_replica_set(&self, user_key: &str, primary: &str, secondary1: &str, secondary2: &str) -> Result<()>;

    /// Every user whose replica set includes the endpoint
    async fn users_for_node(&self, endpoint: &str) -> Result<Vec<UserAssignment>>;

    /// Create or replace a user's assignment
    async fn register(&self, user_key: &str, _user_id: u64, _replica_set: &ReplicaSet) -> Result<()> {
        Err(Error::Registry(format!("Registry does not accept new users ({})", user_key)))
    }
}
