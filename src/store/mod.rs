//! Terminal status records.
//!
//! A record is written once per terminal outcome, keyed by job ID. Writes are
//! upserts: a job that was requeued after its first worker vanished may be
//! reported twice, and the later write replaces the earlier one.

pub mod file;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use file::FileStatusStore;
pub use memory::MemoryStatusStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Success,
    Error,
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalStatus::Success => write!(f, "success"),
            TerminalStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub job_id: String,
    pub status: TerminalStatus,
    /// Empty on success
    pub error_message: String,
    pub scheduled_time: DateTime<Utc>,
    pub completion_time: DateTime<Utc>,
}

impl StatusRecord {
    pub fn success(
        job_id: impl Into<String>,
        scheduled_time: DateTime<Utc>,
        completion_time: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: TerminalStatus::Success,
            error_message: String::new(),
            scheduled_time,
            completion_time,
        }
    }

    pub fn error(
        job_id: impl Into<String>,
        error_message: impl Into<String>,
        scheduled_time: DateTime<Utc>,
        completion_time: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: TerminalStatus::Error,
            error_message: error_message.into(),
            scheduled_time,
            completion_time,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TerminalStatus::Success
    }
}

/// Keyed sink for terminal job outcomes.
#[tonic::async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert or replace the record for `record.job_id`.
    async fn upsert(&self, record: StatusRecord) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<StatusRecord>>;
}
