use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};

use crate::dispatch::{AssignOutcome, Assignment, ProbeHealth, ProbeReport, WorkerClient};
use crate::error::{RelayError, Result};
use crate::grpc::{from_millis, grpc_uri, to_millis};
use crate::proto::coordinator_service_client::CoordinatorServiceClient;
use crate::proto::worker_service_client::WorkerServiceClient;
use crate::proto::{
    AssignDecision, AssignJobRequest, HealthProbeRequest, HealthState, QueryJobRequest,
};

/// gRPC implementation of the dispatch protocol.
///
/// Channels are cached per worker address and created lazily, so the pool
/// lock is never held across a network round trip.
pub struct GrpcWorkerClient {
    timeout: Duration,
    pool: Mutex<HashMap<String, WorkerServiceClient<Channel>>>,
}

impl GrpcWorkerClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pool: Mutex::new(HashMap::new()),
        }
    }

    async fn client(
        &self,
        worker_id: &str,
        address: &str,
    ) -> Result<WorkerServiceClient<Channel>> {
        let mut pool = self.pool.lock().await;
        if let Some(client) = pool.get(address) {
            return Ok(client.clone());
        }

        let endpoint =
            Endpoint::from_shared(grpc_uri(address)).map_err(|e| RelayError::WorkerUnreachable {
                worker_id: worker_id.to_string(),
                reason: format!("invalid address {}: {}", address, e),
            })?;
        let channel = endpoint
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect_lazy();
        let client = WorkerServiceClient::new(channel);

        pool.insert(address.to_string(), client.clone());
        Ok(client)
    }

    async fn evict(&self, address: &str) {
        self.pool.lock().await.remove(address);
    }

    async fn unreachable(&self, worker_id: &str, address: &str, status: tonic::Status) -> RelayError {
        self.evict(address).await;
        RelayError::WorkerUnreachable {
            worker_id: worker_id.to_string(),
            reason: format!("{:?}: {}", status.code(), status.message()),
        }
    }
}

#[tonic::async_trait]
impl WorkerClient for GrpcWorkerClient {
    async fn assign_job(
        &self,
        worker_id: &str,
        address: &str,
        assignment: &Assignment,
    ) -> Result<AssignOutcome> {
        let mut client = self.client(worker_id, address).await?;
        let request = AssignJobRequest {
            job_id: assignment.job_id.clone(),
            task_payload: assignment.task.clone(),
            scheduled_at_ms: to_millis(assignment.scheduled_at),
        };

        let response = match client.assign_job(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(self.unreachable(worker_id, address, status).await),
        };

        match AssignDecision::try_from(response.decision) {
            Ok(AssignDecision::Accepted) => Ok(AssignOutcome::Accepted),
            Ok(AssignDecision::Rejected) => Ok(AssignOutcome::Rejected(response.reason)),
            _ => Ok(AssignOutcome::Rejected(format!(
                "unrecognized decision {}",
                response.decision
            ))),
        }
    }

    async fn health_probe(&self, worker_id: &str, address: &str) -> Result<ProbeReport> {
        let mut client = self.client(worker_id, address).await?;
        let response = match client.health_probe(HealthProbeRequest {}).await {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(self.unreachable(worker_id, address, status).await),
        };

        let health = match HealthState::try_from(response.state) {
            Ok(HealthState::Healthy) => ProbeHealth::Healthy,
            _ => ProbeHealth::Unhealthy,
        };
        Ok(ProbeReport {
            health,
            busy: response.busy,
        })
    }

    async fn query_job(&self, worker_id: &str, address: &str) -> Result<Option<Assignment>> {
        let mut client = self.client(worker_id, address).await?;
        let response = match client.query_job(QueryJobRequest {}).await {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(self.unreachable(worker_id, address, status).await),
        };
        if response.job_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(Assignment {
            job_id: response.job_id,
            task: response.task_payload,
            scheduled_at: from_millis(response.scheduled_at_ms),
        }))
    }
}

/// Connect to a coordinator by URL ("http://host:port" or "host:port").
pub async fn connect_coordinator(url: &str) -> Result<CoordinatorServiceClient<Channel>> {
    let channel = Endpoint::from_shared(grpc_uri(url))
        .map_err(|e| RelayError::Config(format!("invalid coordinator url {}: {}", url, e)))?
        .connect()
        .await?;
    Ok(CoordinatorServiceClient::new(channel))
}

/// Lazily connected coordinator client; the first call dials.
pub fn coordinator_client_lazy(
    url: &str,
    timeout: Duration,
) -> Result<CoordinatorServiceClient<Channel>> {
    let channel = Endpoint::from_shared(grpc_uri(url))
        .map_err(|e| RelayError::Config(format!("invalid coordinator url {}: {}", url, e)))?
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect_lazy();
    Ok(CoordinatorServiceClient::new(channel))
}
