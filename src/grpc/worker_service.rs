use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::dispatch::{AssignOutcome, Assignment};
use crate::grpc::{from_millis, to_millis};
use crate::proto::worker_service_server::WorkerService;
use crate::proto::{
    AssignDecision, AssignJobRequest, AssignJobResponse, HealthProbeRequest, HealthProbeResponse,
    HealthState, QueryJobRequest, QueryJobResponse,
};
use crate::worker::ExecutionEngine;

/// Worker-side half of the dispatch protocol.
pub struct WorkerServiceImpl {
    engine: Arc<ExecutionEngine>,
}

impl WorkerServiceImpl {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerServiceImpl {
    async fn assign_job(
        &self,
        request: Request<AssignJobRequest>,
    ) -> Result<Response<AssignJobResponse>, Status> {
        let req = request.into_inner();
        if req.job_id.is_empty() {
            return Err(Status::invalid_argument("Job ID cannot be empty"));
        }

        let assignment = Assignment {
            job_id: req.job_id,
            task: req.task_payload,
            scheduled_at: from_millis(req.scheduled_at_ms),
        };
        let response = match self.engine.try_accept(assignment).await {
            AssignOutcome::Accepted => AssignJobResponse {
                decision: AssignDecision::Accepted as i32,
                reason: String::new(),
            },
            AssignOutcome::Rejected(reason) => AssignJobResponse {
                decision: AssignDecision::Rejected as i32,
                reason,
            },
        };
        Ok(Response::new(response))
    }

    async fn health_probe(
        &self,
        _request: Request<HealthProbeRequest>,
    ) -> Result<Response<HealthProbeResponse>, Status> {
        let state = if self.engine.is_accepting().await {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };
        Ok(Response::new(HealthProbeResponse {
            state: state as i32,
            busy: self.engine.is_busy().await,
        }))
    }

    async fn query_job(
        &self,
        _request: Request<QueryJobRequest>,
    ) -> Result<Response<QueryJobResponse>, Status> {
        let response = match self.engine.current_assignment().await {
            Some(held) => QueryJobResponse {
                job_id: held.job_id,
                task_payload: held.task,
                scheduled_at_ms: to_millis(held.scheduled_at),
            },
            None => QueryJobResponse::default(),
        };
        Ok(Response::new(response))
    }
}
