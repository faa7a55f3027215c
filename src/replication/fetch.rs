//! Content Fetching
//!
//! Pulls content referenced by replicated records from any reachable
//! replica with bounded retries. An artifact that cannot be fetched is
//! reported as [`FetchOutcome::Unavailable`] so the caller decides
//! whether to skip it; only local storage failures are returned as errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::network::PeerClient;

/// Result of fetching one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Already stored locally
    Present,
    /// Fetched and verified
    Fetched { source: String },
    /// Every source and retry failed
    Unavailable { reason: String },
}

impl FetchOutcome {
    pub fn is_available(&self) -> bool {
        !matches!(self, FetchOutcome::Unavailable { .. })
    }
}

pub struct ContentFetcher {
    store: Arc<dyn ContentStore>,
    client: Arc<dyn PeerClient>,
    max_retries: u32,
    retry_delay: Duration,
    concurrency: usize,
}

impl ContentFetcher {
    pub fn new(
        store: Arc<dyn ContentStore>,
        client: Arc<dyn PeerClient>,
        max_retries: u32,
        retry_delay: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            client,
            max_retries: max_retries.max(1),
            retry_delay,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch one artifact, trying every source once per round
    pub async fn fetch(&self, hash: &str, sources: &[String]) -> Result<FetchOutcome> {
        if self.store.has(hash).await? {
            return Ok(FetchOutcome::Present);
        }

        let mut last_error = String::from("no content sources");
        for attempt in 1..=self.max_retries {
            for source in sources {
                match self.client.fetch_content(source, hash).await {
                    Ok(bytes) => match self.store.put_verified(hash, &bytes).await {
                        Ok(()) => {
                            return Ok(FetchOutcome::Fetched {
                                source: source.clone(),
                            })
                        }
                        Err(e @ Error::ContentHashMismatch { .. }) => last_error = format!("{}: {}", source, e),
                        Err(e) => return Err(e),
                    },
                    Err(e) => last_error = format!("{}: {}", source, e),
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        tracing::warn!(hash, attempts = self.max_retries, error = %last_error, "Content unavailable");
        Ok(FetchOutcome::Unavailable { reason: last_error })
    }

    /// Fetch many artifacts with bounded concurrency
    pub async fn fetch_all(&self, hashes: Vec<String>, sources: &[String]) -> Result<HashMap<String, FetchOutcome>> {
        let results: Vec<(String, Result<FetchOutcome>)> = stream::iter(hashes)
            .map(|hash| async move {
                let outcome = self.fetch(&hash, sources).await;
                (hash, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut outcomes = HashMap::with_capacity(results.len());
        for (hash, outcome) in results {
            outcomes.insert(hash, outcome?);
        }
        Ok(outcomes)
    }
}
