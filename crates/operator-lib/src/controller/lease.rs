//! Leader lease
//!
//! Exactly one controller instance reconciles at a time. The active instance
//! holds a time-bounded lease and renews it well before it expires; standbys
//! keep trying to acquire it.
//!
//! [`FileLease`] serializes instances through an exclusively created lock
//! file next to the lease, and re-reads the lease after every write: a write
//! only counts when the stored record is the one this instance wrote.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{OptimizerError, Result};

#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Take the lease if it is free, expired, or already ours
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool>;

    /// Extend a lease we hold; `false` means it was lost
    async fn renew(&self, holder: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, holder: &str) -> Result<()>;
}

/// Process-local lease, for single-instance runs and tests
#[derive(Default)]
pub struct InMemoryLease {
    state: Mutex<Option<(String, Instant)>>,
}

impl InMemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn holder(&self) -> Option<String> {
        match &*self.state.lock().await {
            Some((holder, expires)) if *expires > Instant::now() => Some(holder.clone()),
            _ => None,
        }
    }
}

#[async_trait]
impl LeaderLease for InMemoryLease {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let free = match &*state {
            None => true,
            Some((current, expires)) => current == holder || *expires <= now,
        };
        if free {
            *state = Some((holder.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match &mut *state {
            Some((current, expires)) if current == holder && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, holder: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(&*state, Some((current, _)) if current == holder) {
            *state = None;
        }
        Ok(())
    }
}

/// Lease persisted as a JSON file shared by all instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl LeaseRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.renewed_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// Age after which a lock file is considered abandoned by a crashed instance
const STALE_LOCK: Duration = Duration::from_secs(10);
const LOCK_ATTEMPTS: u32 = 5;
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Held lock file; removed on drop
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// File-backed lease for instances sharing a state volume
pub struct FileLease {
    path: PathBuf,
    /// Serializes this process's read-modify-write cycles
    guard: Mutex<()>,
}

impl FileLease {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            guard: Mutex::new(()),
        }
    }

    pub async fn read(&self) -> Result<Option<LeaseRecord>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Take the cross-instance lock guarding a read-modify-write of the lease.
    /// `None` when another instance kept it for every attempt.
    async fn lock(&self, holder: &str) -> Result<Option<LockFile>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let path = self.lock_path();
        for attempt in 1..=LOCK_ATTEMPTS {
            let created = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match created {
                Ok(mut file) => {
                    let lock = LockFile { path };
                    file.write_all(holder.as_bytes()).await?;
                    return Ok(Some(lock));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        warn!(path = %path.display(), "Breaking abandoned lease lock");
                        let _ = fs::remove_file(&path).await;
                    } else if attempt < LOCK_ATTEMPTS {
                        tokio::time::sleep(LOCK_RETRY).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn write(&self, record: &LeaseRecord) -> Result<()> {
        let holder: String = record
            .holder
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let tmp = self.path.with_extension(format!("{}.tmp", holder));
        fs::write(&tmp, serde_json::to_vec(record)?).await?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| OptimizerError::store("lease", e.to_string()))
    }

    /// Write `record` and check it is what the lease file now holds
    async fn commit(&self, record: &LeaseRecord) -> Result<bool> {
        self.write(record).await?;
        let stored = self.read().await?;
        let ours = stored
            .as_ref()
            .map(|s| s.holder == record.holder && s.renewed_at == record.renewed_at)
            .unwrap_or(false);
        if !ours {
            warn!(holder = %record.holder, "Lease write was overtaken by another instance");
        }
        Ok(ours)
    }
}

async fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age > STALE_LOCK)
        .unwrap_or(false)
}

#[async_trait]
impl LeaderLease for FileLease {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let _guard = self.guard.lock().await;
        let Some(_lock) = self.lock(holder).await? else {
            debug!(holder = %holder, "Lease busy");
            return Ok(false);
        };
        let now = Utc::now();
        let acquired_at = match self.read().await? {
            Some(current) if current.holder == holder => current.acquired_at,
            Some(current) if !current.is_expired(now) => {
                debug!(
                    holder = %current.holder,
                    expires_at = %current.expires_at(),
                    "Lease held elsewhere"
                );
                return Ok(false);
            }
            _ => now,
        };
        self.commit(&LeaseRecord {
            holder: holder.to_string(),
            acquired_at,
            renewed_at: now,
            ttl_secs: ttl.as_secs().max(1),
        })
        .await
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let _guard = self.guard.lock().await;
        let lock = self.lock(holder).await?;
        let now = Utc::now();
        let current = match self.read().await? {
            Some(current) if current.holder == holder && !current.is_expired(now) => current,
            _ => return Ok(false),
        };
        if lock.is_none() {
            // Nobody can take an unexpired lease; extend it on the next tick
            debug!(holder = %holder, "Lease busy, keeping the current term");
            return Ok(true);
        }
        self.commit(&LeaseRecord {
            renewed_at: now,
            ttl_secs: ttl.as_secs().max(1),
            ..current
        })
        .await
    }

    async fn release(&self, holder: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        let _lock = self.lock(holder).await?;
        if let Some(current) = self.read().await? {
            if current.holder == holder {
                match fs::remove_file(&self.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}
