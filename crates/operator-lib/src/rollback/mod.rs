//! Rollback Store
//!
//! Redundant storage of the pre-change spec of every optimized workload:
//! - a low-latency store with a bounded TTL ([`fast::InMemoryTtlStore`])
//! - a durable store with no expiry ([`durable::FileRecordStore`])
//!
//! Writes go to both; the apply proceeds as long as one succeeds. Reads
//! consult both and return the newest record, skipping a fast copy older
//! than the fast store's TTL. A fast copy the durable store has already
//! archived is a leftover of an incomplete removal and is dropped.

pub mod durable;
pub mod fast;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{OptimizerError, Result};
use crate::models::{RollbackRecord, WorkloadRef, WorkloadSpec};

pub use durable::FileRecordStore;
pub use fast::InMemoryTtlStore;

/// One backing store for rollback records
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn put(&self, record: &RollbackRecord) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<RollbackRecord>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Retire a record after a completed rollback
    async fn archive(&self, key: &str) -> Result<()> {
        self.delete(key).await
    }

    /// Whether `record` was retired through [`RecordStore::archive`]
    async fn is_archived(&self, _record: &RollbackRecord) -> Result<bool> {
        Ok(false)
    }
}

/// Result of a dual write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub fast_ok: bool,
    pub durable_ok: bool,
    /// Set when only one store accepted the record
    pub warning: Option<String>,
}

impl StoreOutcome {
    pub fn is_degraded(&self) -> bool {
        !(self.fast_ok && self.durable_ok)
    }

    /// Name of the store that rejected the write, if any
    pub fn failed_store(&self) -> Option<&'static str> {
        match (self.fast_ok, self.durable_ok) {
            (false, _) => Some("fast"),
            (_, false) => Some("durable"),
            _ => None,
        }
    }
}

/// Logical rollback store over a fast and a durable backend
pub struct RollbackStore {
    fast: Arc<dyn RecordStore>,
    durable: Arc<dyn RecordStore>,
    /// Records older than this are not trusted from the fast store
    fast_ttl: Duration,
}

impl RollbackStore {
    pub fn new(
        fast: Arc<dyn RecordStore>,
        durable: Arc<dyn RecordStore>,
        fast_ttl: Duration,
    ) -> Self {
        Self {
            fast,
            durable,
            fast_ttl,
        }
    }

    /// Dual-write `record`. Fails only when neither store accepted it.
    pub async fn store(&self, record: &RollbackRecord) -> Result<StoreOutcome> {
        let (fast, durable) = tokio::join!(self.fast.put(record), self.durable.put(record));

        match (fast, durable) {
            (Ok(()), Ok(())) => Ok(StoreOutcome {
                fast_ok: true,
                durable_ok: true,
                warning: None,
            }),
            (Err(e), Ok(())) => {
                warn!(
                    key = %record.key,
                    store = self.fast.name(),
                    error = %e,
                    "Rollback record not written to fast store"
                );
                Ok(StoreOutcome {
                    fast_ok: false,
                    durable_ok: true,
                    warning: Some(format!("rollback record stored in durable store only: {}", e)),
                })
            }
            (Ok(()), Err(e)) => {
                warn!(
                    key = %record.key,
                    store = self.durable.name(),
                    error = %e,
                    "Rollback record not written to durable store"
                );
                Ok(StoreOutcome {
                    fast_ok: true,
                    durable_ok: false,
                    warning: Some(format!("rollback record stored in fast store only: {}", e)),
                })
            }
            (Err(fast), Err(durable)) => Err(OptimizerError::store(
                "rollback",
                format!("both stores rejected {}: {}; {}", record.key, fast, durable),
            )),
        }
    }

    /// Capture the pre-optimization spec of `live`, unless a baseline already exists.
    ///
    /// Returns `None` when an earlier baseline was kept.
    pub async fn capture_baseline(
        &self,
        live: &WorkloadSpec,
        recommendation_id: &str,
    ) -> Result<Option<StoreOutcome>> {
        let key = RollbackRecord::key_for(&live.reference);
        if let Some(existing) = self.restore(&key).await? {
            debug!(
                key = %key,
                recommendation_id = %existing.recommendation_id,
                "Keeping existing rollback baseline"
            );
            return Ok(None);
        }
        let record = RollbackRecord::capture(live, recommendation_id);
        self.store(&record).await.map(Some)
    }

    /// Read the current record for `key`
    pub async fn restore(&self, key: &str) -> Result<Option<RollbackRecord>> {
        let (fast, durable) = tokio::join!(self.fast.get(key), self.durable.get(key));
        let fast = fast.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "Fast rollback store read failed, using durable store");
            None
        });
        let durable = match durable {
            Ok(record) => record,
            Err(e) if fast.is_some() => {
                warn!(
                    key = %key,
                    error = %e,
                    "Durable rollback store read failed, using fast store"
                );
                None
            }
            Err(e) => return Err(e),
        };

        match (fast, durable) {
            (Some(fast), Some(durable)) => {
                if self.is_stale(&fast) || durable.captured_at > fast.captured_at {
                    Ok(Some(durable))
                } else {
                    Ok(Some(fast))
                }
            }
            (Some(fast), None) => {
                let retired = self.durable.is_archived(&fast).await.unwrap_or_else(|e| {
                    warn!(key = %key, error = %e, "Could not check the rollback archive");
                    false
                });
                if !retired {
                    return Ok(Some(fast));
                }
                debug!(
                    key = %key,
                    recommendation_id = %fast.recommendation_id,
                    "Dropping retired rollback record"
                );
                if let Err(e) = self.fast.delete(key).await {
                    warn!(key = %key, error = %e, "Failed to drop retired rollback record");
                }
                Ok(None)
            }
            (None, durable) => Ok(durable),
        }
    }

    pub async fn restore_for(&self, workload: &WorkloadRef) -> Result<Option<RollbackRecord>> {
        self.restore(&RollbackRecord::key_for(workload)).await
    }

    /// Retire a record: dropped from the fast store, archived in the durable one
    pub async fn remove(&self, key: &str) -> Result<()> {
        if let Err(e) = self.fast.delete(key).await {
            warn!(key = %key, error = %e, "Failed to drop rollback record from fast store");
        }
        self.durable.archive(key).await
    }

    fn is_stale(&self, record: &RollbackRecord) -> bool {
        let age = Utc::now().signed_duration_since(record.captured_at);
        age.to_std().map(|age| age > self.fast_ttl).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::workload;
    use crate::models::WorkloadKind;
    use tempfile::TempDir;

    async fn stores(dir: &TempDir) -> (Arc<InMemoryTtlStore>, Arc<FileRecordStore>, RollbackStore) {
        let fast = Arc::new(InMemoryTtlStore::default());
        let durable = Arc::new(FileRecordStore::open(dir.path()).await.unwrap());
        let store = RollbackStore::new(fast.clone(), durable.clone(), fast::DEFAULT_TTL);
        (fast, durable, store)
    }

    #[tokio::test]
    async fn test_dual_write() {
        let dir = TempDir::new().unwrap();
        let (fast, durable, store) = stores(&dir).await;
        let spec = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");
        let record = RollbackRecord::capture(&spec, "rec-1");

        let outcome = store.store(&record).await.unwrap();
        assert!(!outcome.is_degraded());
        assert_eq!(fast.get(&record.key).await.unwrap(), Some(record.clone()));
        assert_eq!(durable.get(&record.key).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_fast_outage_falls_back_to_durable() {
        let dir = TempDir::new().unwrap();
        let (fast, _durable, store) = stores(&dir).await;
        let spec = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");
        let record = RollbackRecord::capture(&spec, "rec-1");

        fast.set_unavailable(true);
        let outcome = store.store(&record).await.unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(outcome.failed_store(), Some("fast"));
        assert!(outcome.warning.is_some());

        assert_eq!(store.restore(&record.key).await.unwrap(), Some(record.clone()));
        fast.set_unavailable(false);
        // Miss in the fast store still finds the durable copy
        assert_eq!(store.restore(&record.key).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_both_stores_failing_is_an_error() {
        let fast = Arc::new(InMemoryTtlStore::default());
        let durable = Arc::new(InMemoryTtlStore::default());
        fast.set_unavailable(true);
        durable.set_unavailable(true);
        let store = RollbackStore::new(fast, durable, fast::DEFAULT_TTL);
        let spec = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");
        let record = RollbackRecord::capture(&spec, "rec-1");
        assert!(store.store(&record).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_fast_record_prefers_durable() {
        let dir = TempDir::new().unwrap();
        let (fast, durable, store) = stores(&dir).await;
        let w = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");

        let mut old = RollbackRecord::capture(&w, "rec-old");
        old.captured_at = Utc::now() - chrono::Duration::days(8);
        fast.put(&old).await.unwrap();
        let fresh = RollbackRecord::capture(&w, "rec-new");
        durable.put(&fresh).await.unwrap();

        let restored = store.restore(&old.key).await.unwrap().unwrap();
        assert_eq!(restored.recommendation_id, "rec-new");
    }

    #[tokio::test]
    async fn test_baseline_is_written_once() {
        let dir = TempDir::new().unwrap();
        let (_fast, _durable, store) = stores(&dir).await;
        let mut w = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");

        assert!(store.capture_baseline(&w, "rec-1").await.unwrap().is_some());
        w.replicas = Some(2);
        assert!(store.capture_baseline(&w, "rec-2").await.unwrap().is_none());

        let record = store.restore_for(&w.reference).await.unwrap().unwrap();
        assert_eq!(record.spec.replicas, Some(3));
        assert_eq!(record.recommendation_id, "rec-1");
    }

    #[tokio::test]
    async fn test_record_left_behind_by_removal_is_retired() {
        let dir = TempDir::new().unwrap();
        let (fast, _durable, store) = stores(&dir).await;
        let mut w = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");
        let key = RollbackRecord::key_for(&w.reference);
        store.capture_baseline(&w, "rec-1").await.unwrap();

        // Fast store is down while the completed rollback retires the record
        fast.set_unavailable(true);
        store.remove(&key).await.unwrap();
        fast.set_unavailable(false);
        assert_eq!(fast.len(), 1);

        assert_eq!(store.restore(&key).await.unwrap(), None);
        assert!(fast.is_empty());

        // The owner edited the workload after the rollback
        w.replicas = Some(6);
        assert!(store.capture_baseline(&w, "rec-2").await.unwrap().is_some());
        let record = store.restore(&key).await.unwrap().unwrap();
        assert_eq!(record.recommendation_id, "rec-2");
        assert_eq!(record.spec.replicas, Some(6));
    }

    #[tokio::test]
    async fn test_newer_durable_record_wins() {
        let dir = TempDir::new().unwrap();
        let (fast, durable, store) = stores(&dir).await;
        let w = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");

        let mut old = RollbackRecord::capture(&w, "rec-old");
        old.captured_at = Utc::now() - chrono::Duration::hours(1);
        fast.put(&old).await.unwrap();
        durable.put(&RollbackRecord::capture(&w, "rec-new")).await.unwrap();

        let restored = store.restore(&old.key).await.unwrap().unwrap();
        assert_eq!(restored.recommendation_id, "rec-new");
    }

    #[tokio::test]
    async fn test_remove_archives_durable_copy() {
        let dir = TempDir::new().unwrap();
        let (fast, durable, store) = stores(&dir).await;
        let spec = workload(WorkloadKind::Deployment, Some(3), "1", "1Gi");
        let record = RollbackRecord::capture(&spec, "rec-1");
        store.store(&record).await.unwrap();

        store.remove(&record.key).await.unwrap();
        assert!(fast.is_empty());
        assert_eq!(store.restore(&record.key).await.unwrap(), None);
        assert_eq!(durable.archived(&record.key).await.unwrap().len(), 1);
    }
}
