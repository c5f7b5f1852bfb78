//! gRPC surface of both process roles.
//!
//! - [`coordinator_service`]: submission, status, worker registration,
//!   heartbeats and completion reports.
//! - [`worker_service`]: the worker side of the dispatch protocol.
//! - [`client`]: the coordinator's [`WorkerClient`](crate::dispatch::WorkerClient)
//!   over tonic, plus coordinator client helpers for workers and the CLI.

pub mod client;
pub mod coordinator_service;
pub mod server;
pub mod worker_service;

use chrono::{DateTime, TimeZone, Utc};

use crate::proto;
use crate::scheduler::{JobState, WorkerHealth};

pub use client::GrpcWorkerClient;
pub use coordinator_service::CoordinatorServiceImpl;
pub use worker_service::WorkerServiceImpl;

/// Normalize "host:port" into a URI tonic can dial.
pub fn grpc_uri(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Zero and out-of-range values fall back to now.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    if ms <= 0 {
        return Utc::now();
    }
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

impl From<JobState> for proto::JobState {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Submitted => proto::JobState::Submitted,
            JobState::Queued => proto::JobState::Queued,
            JobState::Assigned => proto::JobState::Assigned,
            JobState::Running => proto::JobState::Running,
            JobState::Succeeded => proto::JobState::Succeeded,
            JobState::Failed => proto::JobState::Failed,
        }
    }
}

impl From<&WorkerHealth> for proto::HealthState {
    fn from(health: &WorkerHealth) -> Self {
        match health {
            WorkerHealth::Healthy => proto::HealthState::Healthy,
            WorkerHealth::Unhealthy { .. } => proto::HealthState::Unhealthy,
            WorkerHealth::Removed => proto::HealthState::Removed,
        }
    }
}

/// Lowercase label used by the CLI and the dashboard.
pub fn job_state_label(state: i32) -> &'static str {
    match proto::JobState::try_from(state) {
        Ok(proto::JobState::Submitted) => "submitted",
        Ok(proto::JobState::Queued) => "queued",
        Ok(proto::JobState::Assigned) => "assigned",
        Ok(proto::JobState::Running) => "running",
        Ok(proto::JobState::Succeeded) => "succeeded",
        Ok(proto::JobState::Failed) => "failed",
        _ => "unknown",
    }
}

pub fn health_state_label(state: i32) -> &'static str {
    match proto::HealthState::try_from(state) {
        Ok(proto::HealthState::Healthy) => "healthy",
        Ok(proto::HealthState::Unhealthy) => "unhealthy",
        Ok(proto::HealthState::Removed) => "removed",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_uri_adds_scheme() {
        assert_eq!(grpc_uri("127.0.0.1:7000"), "http://127.0.0.1:7000");
        assert_eq!(grpc_uri("http://host:1"), "http://host:1");
        assert_eq!(grpc_uri("https://host:1"), "https://host:1");
    }

    #[test]
    fn millis_round_trip_keeps_precision() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        assert_eq!(from_millis(to_millis(at)), at);
    }

    #[test]
    fn labels_match_proto_values() {
        assert_eq!(job_state_label(proto::JobState::Running as i32), "running");
        assert_eq!(job_state_label(99), "unknown");
        assert_eq!(
            health_state_label(proto::HealthState::Unhealthy as i32),
            "unhealthy"
        );
    }

    #[test]
    fn unhealthy_maps_regardless_of_since() {
        let health = WorkerHealth::Unhealthy {
            since: std::time::Instant::now(),
        };
        assert_eq!(proto::HealthState::from(&health), proto::HealthState::Unhealthy);
    }
}
