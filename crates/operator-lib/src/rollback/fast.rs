//! Low-latency rollback record store with bounded TTL

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::RecordStore;
use crate::error::{OptimizerError, Result};
use crate::models::RollbackRecord;

/// Default record lifetime in the fast store (7 days)
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// In-memory store whose entries expire after `ttl`
pub struct InMemoryTtlStore {
    entries: DashMap<String, (RollbackRecord, Instant)>,
    ttl: Duration,
    unavailable: AtomicBool,
}

impl Default for InMemoryTtlStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl InMemoryTtlStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Simulate an outage: every operation fails while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OptimizerError::store(self.name(), "unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryTtlStore {
    fn name(&self) -> &'static str {
        "fast"
    }

    async fn put(&self, record: &RollbackRecord) -> Result<()> {
        self.check_available()?;
        self.entries
            .insert(record.key.clone(), (record.clone(), Instant::now() + self.ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<RollbackRecord>> {
        self.check_available()?;
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::workload;
    use crate::models::WorkloadKind;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = InMemoryTtlStore::new(Duration::from_secs(60));
        let spec = workload(WorkloadKind::Deployment, Some(2), "1", "1Gi");
        let record = RollbackRecord::capture(&spec, "rec-1");
        store.put(&record).await.unwrap();
        assert_eq!(store.get(&record.key).await.unwrap(), Some(record.clone()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get(&record.key).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let store = InMemoryTtlStore::default();
        let spec = workload(WorkloadKind::Deployment, Some(2), "1", "1Gi");
        let record = RollbackRecord::capture(&spec, "rec-1");
        store.set_unavailable(true);
        assert!(store.put(&record).await.is_err());
        assert!(store.get(&record.key).await.is_err());
        store.set_unavailable(false);
        assert_eq!(store.get(&record.key).await.unwrap(), None);
    }
}
