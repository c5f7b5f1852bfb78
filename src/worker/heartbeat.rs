use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Code;

use crate::grpc::to_millis;
use crate::proto::coordinator_service_client::CoordinatorServiceClient;
use crate::proto::{HeartbeatRequest, RegisterWorkerRequest};
use crate::worker::engine::ExecutionEngine;

/// Keeps this worker registered and alive in the coordinator's registry.
pub struct HeartbeatSender {
    worker_id: String,
    address: String,
    interval: Duration,
    client: CoordinatorServiceClient<Channel>,
    engine: Arc<ExecutionEngine>,
}

impl HeartbeatSender {
    pub fn new(
        worker_id: impl Into<String>,
        address: impl Into<String>,
        interval: Duration,
        client: CoordinatorServiceClient<Channel>,
        engine: Arc<ExecutionEngine>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            address: address.into(),
            interval,
            client,
            engine,
        }
    }

    /// Register, then heartbeat every interval until `cancel` fires.
    ///
    /// A coordinator that answers NOT_FOUND has forgotten this worker
    /// (restart or removal), so the next tick registers again.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut registered = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if !registered {
                registered = self.register().await;
                continue;
            }

            match self.beat().await {
                Ok(()) => {}
                Err(status) if status.code() == Code::NotFound => {
                    tracing::info!(worker_id = %self.worker_id, "Coordinator does not know this worker, re-registering");
                    registered = self.register().await;
                }
                Err(status) => {
                    tracing::debug!(worker_id = %self.worker_id, error = %status, "Heartbeat failed");
                }
            }
        }
        tracing::debug!(worker_id = %self.worker_id, "Heartbeat sender stopped");
    }

    async fn register(&self) -> bool {
        let mut client = self.client.clone();
        let request = RegisterWorkerRequest {
            worker_id: self.worker_id.clone(),
            address: self.address.clone(),
        };
        match client.register_worker(request).await {
            Ok(_) => {
                tracing::info!(worker_id = %self.worker_id, address = %self.address, "Registered with coordinator");
                true
            }
            Err(status) => {
                tracing::warn!(worker_id = %self.worker_id, error = %status, "Registration failed, will retry");
                false
            }
        }
    }

    async fn beat(&self) -> Result<(), tonic::Status> {
        let held = self.engine.current_assignment().await;
        let mut request = HeartbeatRequest {
            worker_id: self.worker_id.clone(),
            busy: held.is_some(),
            ..Default::default()
        };
        if let Some(held) = held {
            request.current_job_id = held.job_id;
            request.current_task_payload = held.task;
            request.current_scheduled_at_ms = to_millis(held.scheduled_at);
        }

        let mut client = self.client.clone();
        client
            .heartbeat(request)
            .await
            .map(|_| ())
    }
}
