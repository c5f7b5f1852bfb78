use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::store::{StatusRecord, StatusStore};

/// One JSON document per job under a directory.
///
/// Each upsert writes a temporary sibling and renames it over the target, so
/// readers see either the previous record or the new one.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    dir: PathBuf,
}

impl FileStatusStore {
    /// Open (and create if needed) the store directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| RelayError::Store(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(job_id)))
    }
}

/// Job IDs are arbitrary strings; keep the filename safe and collision-free.
fn file_stem(job_id: &str) -> String {
    let mut stem = String::with_capacity(job_id.len());
    for byte in job_id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => stem.push(byte as char),
            other => stem.push_str(&format!("%{:02X}", other)),
        }
    }
    stem
}

#[tonic::async_trait]
impl StatusStore for FileStatusStore {
    async fn upsert(&self, record: StatusRecord) -> Result<()> {
        let path = self.record_path(&record.job_id);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", file_stem(&record.job_id), Uuid::new_v4()));
        let body =
            serde_json::to_vec_pretty(&record).map_err(|e| RelayError::Store(e.to_string()))?;

        fs::write(&tmp, body)
            .await
            .map_err(|e| RelayError::Store(format!("{}: {}", tmp.display(), e)))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(RelayError::Store(format!("{}: {}", path.display(), e)));
        }

        tracing::debug!(job_id = %record.job_id, status = %record.status, path = %path.display(), "Status record written");
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<StatusRecord>> {
        let path = self.record_path(job_id);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| RelayError::Store(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RelayError::Store(format!("{}: {}", path.display(), e))),
        }
    }
}
