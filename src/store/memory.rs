use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::{StatusRecord, StatusStore};

/// In-process store, used by tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: RwLock<HashMap<String, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<StatusRecord> {
        let mut records: Vec<StatusRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        records
    }
}

#[tonic::async_trait]
impl StatusStore for MemoryStatusStore {
    async fn upsert(&self, record: StatusRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.job_id.clone(), record);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<StatusRecord>> {
        Ok(self.records.read().await.get(job_id).cloned())
    }
}
