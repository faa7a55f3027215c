//! Sync Deduplicator
//!
//! Keeps at most one queued (not yet active) sync job per
//! `(sync type, user, secondary)`. The entry is dropped when a worker
//! picks the job up, so a new job for the same target may queue while
//! the first one runs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::replication::SyncType;

/// Dedup key for a sync job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncKey {
    pub sync_type: SyncType,
    pub user_key: String,
    pub secondary: String,
}

/// Handle to a queued sync job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub sync_type: SyncType,
    pub user_key: String,
    pub secondary: String,
    pub enqueued_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(sync_type: SyncType, user_key: &str, secondary: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_type,
            user_key: user_key.to_string(),
            secondary: secondary.to_string(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn key(&self) -> SyncKey {
        SyncKey {
            sync_type: self.sync_type,
            user_key: self.user_key.clone(),
            secondary: self.secondary.clone(),
        }
    }
}

/// Result of an enqueue attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A new job was queued
    New(JobHandle),
    /// An identical job is already waiting; nothing was queued
    Duplicate(JobHandle),
}

impl Enqueued {
    pub fn handle(&self) -> &JobHandle {
        match self {
            Enqueued::New(handle) | Enqueued::Duplicate(handle) => handle,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Enqueued::New(_))
    }
}

/// Process-local map of queued sync jobs
#[derive(Default)]
pub struct SyncDeduplicator {
    queued: Mutex<HashMap<SyncKey, JobHandle>>,
}

impl SyncDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job for the triple unless one is already queued
    pub async fn try_enqueue(&self, sync_type: SyncType, user_key: &str, secondary: &str) -> Enqueued {
        let handle = JobHandle::new(sync_type, user_key, secondary);
        let mut queued = self.queued.lock().await;

        if let Some(existing) = queued.get(&handle.key()) {
            return Enqueued::Duplicate(existing.clone());
        }

        queued.insert(handle.key(), handle.clone());
        Enqueued::New(handle)
    }

    /// Drop the entry for a job that a worker has picked up
    pub async fn activate(&self, job: &JobHandle) {
        let mut queued = self.queued.lock().await;
        let key = job.key();
        if queued.get(&key).map(|h| h.id) == Some(job.id) {
            queued.remove(&key);
        }
    }

    /// Forget a job that never made it onto a queue
    pub async fn discard(&self, job: &JobHandle) {
        self.activate(job).await;
    }

    /// Number of queued jobs
    pub async fn len(&self) -> usize {
        self.queued.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_until_active() {
        let dedup = SyncDeduplicator::new();

        let first = dedup.try_enqueue(SyncType::Recurring, "0xabc", "http://cn2").await;
        let second = dedup.try_enqueue(SyncType::Recurring, "0xabc", "http://cn2").await;
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.handle(), second.handle());

        dedup.activate(first.handle()).await;
        let third = dedup.try_enqueue(SyncType::Recurring, "0xabc", "http://cn2").await;
        assert!(third.is_new());
        assert_ne!(third.handle().id, first.handle().id);
    }

    #[tokio::test]
    async fn test_triple_is_the_key() {
        let dedup = SyncDeduplicator::new();

        assert!(dedup.try_enqueue(SyncType::Recurring, "0xabc", "http://cn2").await.is_new());
        assert!(dedup.try_enqueue(SyncType::Manual, "0xabc", "http://cn2").await.is_new());
        assert!(dedup.try_enqueue(SyncType::Recurring, "0xabc", "http://cn3").await.is_new());
        assert!(dedup.try_enqueue(SyncType::Recurring, "0xdef", "http://cn2").await.is_new());
        assert_eq!(dedup.len().await, 4);
    }

    #[tokio::test]
    async fn test_stale_activation_keeps_newer_entry() {
        let dedup = SyncDeduplicator::new();

        let first = dedup.try_enqueue(SyncType::Manual, "0xabc", "http://cn2").await;
        dedup.activate(first.handle()).await;
        let second = dedup.try_enqueue(SyncType::Manual, "0xabc", "http://cn2").await;

        // A repeated activation of the old job must not drop the new one
        dedup.activate(first.handle()).await;
        assert_eq!(dedup.len().await, 1);
        let again = dedup.try_enqueue(SyncType::Manual, "0xabc", "http://cn2").await;
        assert_eq!(again, Enqueued::Duplicate(second.handle().clone()));
    }
}
