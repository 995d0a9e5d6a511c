//! Utilization Store contract and an in-memory implementation

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::models::{UtilizationSample, WorkloadRef};

/// Retention kept by the in-memory store (30 days)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

/// Time-ordered utilization history per workload
#[async_trait]
pub trait UtilizationStore: Send + Sync {
    /// Samples of `workload` within `window`, oldest first
    async fn get_samples(
        &self,
        workload: &WorkloadRef,
        window: Duration,
    ) -> Result<Vec<UtilizationSample>>;
}

/// Append-only sample store keyed by workload.
///
/// Windows are anchored at the newest retained sample of each series, so a
/// replayed history (inventory file, tests) analyzes the same way no matter
/// when it is loaded.
pub struct InMemoryUtilizationStore {
    series: DashMap<String, Vec<UtilizationSample>>,
    retention: Duration,
}

impl Default for InMemoryUtilizationStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl InMemoryUtilizationStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            series: DashMap::new(),
            retention,
        }
    }

    /// Append samples, keeping the series ordered and within retention
    pub fn append(
        &self,
        workload: &WorkloadRef,
        samples: impl IntoIterator<Item = UtilizationSample>,
    ) {
        let mut series = self.series.entry(workload.key()).or_default();
        series.extend(samples);
        series.sort_by_key(|s| s.timestamp);
        series.dedup_by_key(|s| s.timestamp);

        if let Some(newest) = series.last().map(|s| s.timestamp) {
            let cutoff = newest - self.retention.as_secs() as i64;
            let before = series.len();
            series.retain(|s| s.timestamp >= cutoff);
            if series.len() < before {
                debug!(
                    workload = %workload,
                    evicted = before - series.len(),
                    "Evicted samples past retention"
                );
            }
        }
    }

    pub fn len(&self, workload: &WorkloadRef) -> usize {
        self.series.get(&workload.key()).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.series.iter().all(|s| s.is_empty())
    }
}

#[async_trait]
impl UtilizationStore for InMemoryUtilizationStore {
    async fn get_samples(
        &self,
        workload: &WorkloadRef,
        window: Duration,
    ) -> Result<Vec<UtilizationSample>> {
        let Some(series) = self.series.get(&workload.key()) else {
            return Ok(Vec::new());
        };
        let Some(newest) = series.last().map(|s| s.timestamp) else {
            return Ok(Vec::new());
        };
        let start = newest - window.as_secs() as i64;
        Ok(series
            .iter()
            .filter(|s| s.timestamp > start)
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkloadKind;

    fn sample(timestamp: i64) -> UtilizationSample {
        UtilizationSample {
            timestamp,
            cpu_cores: 0.5,
            memory_bytes: 1024,
            network_bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_window_anchored_at_newest_sample() {
        let store = InMemoryUtilizationStore::default();
        let web = WorkloadRef::new(WorkloadKind::Deployment, "shop", "web");
        store.append(&web, (0..48).map(|h| sample(h * 3600)));

        let day = store
            .get_samples(&web, Duration::from_secs(24 * 3600))
            .await
            .unwrap();
        assert_eq!(day.len(), 24);
        assert_eq!(day.first().unwrap().timestamp, 24 * 3600);
        assert!(day.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_unknown_workload_is_empty() {
        let store = InMemoryUtilizationStore::default();
        let web = WorkloadRef::new(WorkloadKind::Deployment, "shop", "web");
        let samples = store.get_samples(&web, Duration::from_secs(60)).await.unwrap();
        assert!(samples.is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_retention_and_ordering() {
        let store = InMemoryUtilizationStore::new(Duration::from_secs(100));
        let web = WorkloadRef::new(WorkloadKind::Deployment, "shop", "web");
        store.append(&web, vec![sample(300), sample(100), sample(300)]);
        assert_eq!(store.len(&web), 1);
        store.append(&web, vec![sample(250), sample(350)]);
        assert_eq!(store.len(&web), 3);
    }
}
