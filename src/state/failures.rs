//! Per-user consecutive sync failure counts.

use std::collections::HashMap;

use tokio::sync::Mutex;

#[derive(Default)]
pub struct UserSyncFailureCounter {
    counts: Mutex<HashMap<String, u32>>,
}

impl UserSyncFailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the count for a user and return the new value
    pub async fn increment(&self, user_key: &str) -> u32 {
        let mut counts = self.counts.lock().await;
        let count = counts.entry(user_key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub async fn get(&self, user_key: &str) -> u32 {
        self.counts.lock().await.get(user_key).copied().unwrap_or(0)
    }

    pub async fn reset(&self, user_key: &str) {
        self.counts.lock().await.remove(user_key);
    }

    pub async fn reset_all(&self) {
        self.counts.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_and_reset() {
        let counter = UserSyncFailureCounter::new();
        assert_eq!(counter.increment("0xabc").await, 1);
        assert_eq!(counter.increment("0xabc").await, 2);
        assert_eq!(counter.get("0xdef").await, 0);

        counter.reset("0xabc").await;
        assert_eq!(counter.get("0xabc").await, 0);

        counter.increment("0xdef").await;
        counter.reset_all().await;
        assert_eq!(counter.get("0xdef").await, 0);
    }
}
