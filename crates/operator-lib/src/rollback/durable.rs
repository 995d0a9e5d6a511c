//! Durable rollback record store
//!
//! One JSON file per record under a state directory. Writes go to a
//! temporary file first and are renamed into place, so a crash never leaves
//! a torn record behind. Archived records move to `archived/` with the
//! archive time appended to the file name.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::RecordStore;
use crate::error::{OptimizerError, Result};
use crate::models::RollbackRecord;

const ARCHIVE_DIR: &str = "archived";

pub struct FileRecordStore {
    dir: PathBuf,
}

impl FileRecordStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(ARCHIVE_DIR)).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(key: &str) -> String {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        format!("{}.json", safe)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    /// Archived copies of a record, oldest first
    pub async fn archived(&self, key: &str) -> Result<Vec<RollbackRecord>> {
        let prefix = format!("{}-", Self::file_name(key).trim_end_matches(".json"));
        let mut names = Vec::new();
        let mut entries = fs::read_dir(self.dir.join(ARCHIVE_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) {
                names.push(name);
            }
        }
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let bytes = fs::read(self.dir.join(ARCHIVE_DIR).join(name)).await?;
            records.push(serde_json::from_slice(&bytes)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn put(&self, record: &RollbackRecord) -> Result<()> {
        let path = self.path_for(&record.key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!(key = %record.key, path = %path.display(), "Rollback record persisted");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<RollbackRecord>> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn archive(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if fs::metadata(&path).await.is_err() {
            return Ok(());
        }
        let stem = Self::file_name(key);
        let stem = stem.trim_end_matches(".json");
        let archived = self.dir.join(ARCHIVE_DIR).join(format!(
            "{}-{}.json",
            stem,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        fs::rename(&path, &archived)
            .await
            .map_err(|e| OptimizerError::store(self.name(), format!("archive {}: {}", key, e)))
    }

    async fn is_archived(&self, record: &RollbackRecord) -> Result<bool> {
        Ok(self.archived(&record.key).await?.iter().any(|archived| {
            archived.captured_at == record.captured_at
                && archived.recommendation_id == record.recommendation_id
        }))
    }
}
