//! Coordinator-to-worker dispatch protocol.
//!
//! Three calls, all served by the worker:
//!
//! - [`WorkerClient::assign_job`]: deliver a job; the worker is the final
//!   authority and rejects when it is already busy.
//! - [`WorkerClient::health_probe`]: active liveness check, reports the busy flag.
//! - [`WorkerClient::query_job`]: the job the worker is currently holding,
//!   with its payload, used to rebuild registry assignments after a
//!   coordinator restart.
//!
//! The coordinator bounds every call with its dispatch timeout. Transport
//! failures surface as
//! [`RelayError::WorkerUnreachable`](crate::error::RelayError::WorkerUnreachable).

use chrono::{DateTime, Utc};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeHealth {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub health: ProbeHealth,
    pub busy: bool,
}

/// What the coordinator sends with an assignment, and what a worker reports
/// back about the job it is holding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: String,
    pub task: String,
    pub scheduled_at: DateTime<Utc>,
}

#[tonic::async_trait]
pub trait WorkerClient: Send + Sync {
    async fn assign_job(
        &self,
        worker_id: &str,
        address: &str,
        assignment: &Assignment,
    ) -> Result<AssignOutcome>;

    async fn health_probe(&self, worker_id: &str, address: &str) -> Result<ProbeReport>;

    async fn query_job(&self, worker_id: &str, address: &str) -> Result<Option<Assignment>>;
}
