use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of times a job may be put back on the queue after losing its worker.
pub const MAX_AUTOMATIC_REQUEUES: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Submitted,
    Queued,
    Assigned,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Submitted => write!(f, "submitted"),
            JobState::Queued => write!(f, "queued"),
            JobState::Assigned => write!(f, "assigned"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Opaque to the coordinator; the worker reads it as the recipe URL.
    pub task: String,
    pub state: JobState,
    pub assigned_worker: Option<String>,
    pub retry_count: u32,
    pub submitted_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(task: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), task)
    }

    pub fn with_id(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            state: JobState::Submitted,
            assigned_worker: None,
            retry_count: 0,
            submitted_at: Utc::now(),
            scheduled_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// A job learned from a worker's self-reported state rather than from a
    /// submission. The task is whatever the worker reported holding; an older
    /// worker may leave it empty.
    pub fn adopted(
        id: impl Into<String>,
        worker_id: impl Into<String>,
        task: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::with_id(id, task);
        job.state = JobState::Running;
        job.assigned_worker = Some(worker_id.into());
        job.scheduled_at = Some(scheduled_at);
        job
    }

    /// Whether the payload is known, so the job could run again elsewhere
    pub fn is_replayable(&self) -> bool {
        !self.task.trim().is_empty()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn mark_queued(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Queued;
        self.assigned_worker = None;
        true
    }

    pub fn mark_assigned(&mut self, worker_id: &str, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Assigned;
        self.assigned_worker = Some(worker_id.to_string());
        self.scheduled_at = Some(at);
        true
    }

    /// Only an assigned job can start running; a completion report that beat
    /// the dispatch acknowledgement leaves the terminal state in place.
    pub fn mark_running(&mut self) -> bool {
        if self.state != JobState::Assigned {
            return false;
        }
        self.state = JobState::Running;
        true
    }

    pub fn mark_succeeded(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Succeeded;
        self.completed_at = Some(at);
        self.error = None;
        true
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = JobState::Failed;
        self.completed_at = Some(at);
        self.error = Some(error.into());
        true
    }

    /// Consume the automatic requeue budget. Returns false once it is spent.
    pub fn take_retry(&mut self) -> bool {
        if self.retry_count >= MAX_AUTOMATIC_REQUEUES {
            return false;
        }
        self.retry_count += 1;
        true
    }
}
