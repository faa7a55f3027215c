//! Sync Queues
//!
//! Two job queues, Manual and Recurring, each drained by a dispatcher
//! task with its own concurrency limit. A dispatcher takes a permit
//! before taking a job, so queued jobs stay deduplicated until a worker
//! slot is actually free.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::replication::SyncType;
use crate::state::{Enqueued, JobHandle, SyncDeduplicator};

/// Executes one sync job taken off a queue
#[async_trait::async_trait]
pub trait SyncJobProcessor: Send + Sync {
    async fn process(&self, job: JobHandle) -> Result<()>;
}

/// Waiting and active job counts per queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub manual_waiting: usize,
    pub manual_active: usize,
    pub recurring_waiting: usize,
    pub recurring_active: usize,
}

struct Lane {
    tx: mpsc::UnboundedSender<JobHandle>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<JobHandle>>>,
    concurrency: usize,
    waiting: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl Lane {
    fn new(concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            concurrency: concurrency.max(1),
            waiting: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Manual and Recurring sync queues sharing one deduplicator
pub struct SyncQueues {
    dedup: Arc<SyncDeduplicator>,
    manual: Lane,
    recurring: Lane,
}

impl SyncQueues {
    pub fn new(manual_concurrency: usize, recurring_concurrency: usize) -> Self {
        Self {
            dedup: Arc::new(SyncDeduplicator::new()),
            manual: Lane::new(manual_concurrency),
            recurring: Lane::new(recurring_concurrency),
        }
    }

    fn lane(&self, sync_type: SyncType) -> &Lane {
        match sync_type {
            SyncType::Manual => &self.manual,
            SyncType::Recurring => &self.recurring,
        }
    }

    /// Queue a sync unless an identical one is already waiting
    pub async fn enqueue(&self, sync_type: SyncType, user_key: &str, secondary: &str) -> Result<Enqueued> {
        let enqueued = self.dedup.try_enqueue(sync_type, user_key, secondary).await;

        if let Enqueued::New(handle) = &enqueued {
            let lane = self.lane(sync_type);
            // Counted before sending so the dispatcher's decrement never runs first
            lane.waiting.fetch_add(1, Ordering::SeqCst);
            if lane.tx.send(handle.clone()).is_err() {
                lane.waiting.fetch_sub(1, Ordering::SeqCst);
                self.dedup.discard(handle).await;
                return Err(Error::ShuttingDown);
            }
            tracing::debug!(user = user_key, secondary, %sync_type, job = %handle.id, "Sync enqueued");
        }

        Ok(enqueued)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            manual_waiting: self.manual.waiting.load(Ordering::SeqCst),
            manual_active: self.manual.active.load(Ordering::SeqCst),
            recurring_waiting: self.recurring.waiting.load(Ordering::SeqCst),
            recurring_active: self.recurring.active.load(Ordering::SeqCst),
        }
    }

    /// Spawn the dispatcher for each queue; can only be called once
    pub fn start(&self, processor: Arc<dyn SyncJobProcessor>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(2);

        for sync_type in [SyncType::Manual, SyncType::Recurring] {
            let lane = self.lane(sync_type);
            let rx = lane
                .rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| Error::Internal(format!("{} sync queue already started", sync_type)))?;

            let dispatcher = Dispatcher {
                sync_type,
                rx,
                permits: Arc::new(Semaphore::new(lane.concurrency)),
                dedup: self.dedup.clone(),
                processor: processor.clone(),
                waiting: lane.waiting.clone(),
                active: lane.active.clone(),
            };
            handles.push(tokio::spawn(dispatcher.run()));
        }

        tracing::info!(
            manual_concurrency = self.manual.concurrency,
            recurring_concurrency = self.recurring.concurrency,
            "Sync queues started"
        );
        Ok(handles)
    }
}

struct Dispatcher {
    sync_type: SyncType,
    rx: mpsc::UnboundedReceiver<JobHandle>,
    permits: Arc<Semaphore>,
    dedup: Arc<SyncDeduplicator>,
    processor: Arc<dyn SyncJobProcessor>,
    waiting: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let job = match self.rx.recv().await {
                Some(job) => job,
                None => break,
            };

            self.dedup.activate(&job).await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            self.active.fetch_add(1, Ordering::SeqCst);

            let processor = self.processor.clone();
            let active = self.active.clone();
            let sync_type = self.sync_type;
            tokio::spawn(async move {
                let job_id = job.id;
                let user = job.user_key.clone();
                let secondary = job.secondary.clone();
                if let Err(e) = processor.process(job).await {
                    tracing::warn!(job = %job_id, user = %user, secondary = %secondary, %sync_type, error = %e, "Sync job failed");
                }
                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        tracing::debug!(sync_type = %self.sync_type, "Sync queue dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct BlockingProcessor {
        started: mpsc::UnboundedSender<JobHandle>,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl SyncJobProcessor for BlockingProcessor {
        async fn process(&self, job: JobHandle) -> Result<()> {
            let _ = self.started.send(job);
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_duplicate_until_active() {
        let queues = SyncQueues::new(1, 1);

        let first = queues.enqueue(SyncType::Recurring, "0xabc", "http://cn2").await.unwrap();
        let second = queues.enqueue(SyncType::Recurring, "0xabc", "http://cn2").await.unwrap();
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.handle().id, second.handle().id);

        // Different type or secondary is a different job
        assert!(queues.enqueue(SyncType::Manual, "0xabc", "http://cn2").await.unwrap().is_new());
        assert!(queues.enqueue(SyncType::Recurring, "0xabc", "http://cn3").await.unwrap().is_new());

        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let processor = Arc::new(BlockingProcessor {
            started: started_tx,
            release: Notify::new(),
        });
        queues.start(processor.clone()).unwrap();

        let mut active_ids = Vec::new();
        for _ in 0..2 {
            let job = tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
                .await
                .unwrap()
                .unwrap();
            active_ids.push(job.id);
        }
        assert!(active_ids.contains(&first.handle().id));

        let third = queues.enqueue(SyncType::Recurring, "0xabc", "http://cn2").await.unwrap();
        assert!(third.is_new());
        assert_ne!(third.handle().id, first.handle().id);
    }

    #[tokio::test]
    async fn test_waiting_count_tracks_queue() {
        let queues = SyncQueues::new(1, 1);
        queues.enqueue(SyncType::Manual, "0xabc", "http://cn2").await.unwrap();
        assert_eq!(queues.stats().manual_waiting, 1);

        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let processor = Arc::new(BlockingProcessor {
            started: started_tx,
            release: Notify::new(),
        });
        queues.start(processor).unwrap();
        tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let stats = queues.stats();
        assert_eq!(stats.manual_waiting, 0);
        assert_eq!(stats.manual_active, 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_leaves_counts_alone() {
        let queues = SyncQueues::new(1, 1);
        drop(queues.recurring.rx.lock().unwrap().take());

        let result = queues.enqueue(SyncType::Recurring, "0xabc", "http://cn2").await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
        assert_eq!(queues.stats().recurring_waiting, 0);

        // The rejected job is not left behind as a duplicate
        assert!(matches!(
            queues.enqueue(SyncType::Recurring, "0xabc", "http://cn2").await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let queues = SyncQueues::new(1, 1);
        let (started, _rx) = mpsc::unbounded_channel();
        let processor = Arc::new(BlockingProcessor {
            started,
            release: Notify::new(),
        });

        queues.start(processor.clone()).unwrap();
        assert!(matches!(queues.start(processor), Err(Error::Internal(_))));
    }
}
