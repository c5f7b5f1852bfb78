use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::coordinator::Coordinator;
use crate::dispatch::Assignment;
use crate::grpc::{from_millis, to_millis};
use crate::proto::coordinator_service_server::CoordinatorService;
use crate::proto::{
    GetJobStatusRequest, GetJobStatusResponse, HeartbeatRequest, HeartbeatResponse,
    HealthState, JobState as ProtoJobState, ListWorkersRequest, ListWorkersResponse,
    RegisterWorkerRequest, RegisterWorkerResponse, ReportCompletionRequest,
    ReportCompletionResponse, SubmitJobRequest, SubmitJobResponse, WorkerInfo,
};
use crate::scheduler::Job;

/// Coordinator-side gRPC API for submitters and workers.
pub struct CoordinatorServiceImpl {
    coordinator: Arc<Coordinator>,
}

impl CoordinatorServiceImpl {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[tonic::async_trait]
impl CoordinatorService for CoordinatorServiceImpl {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let req = request.into_inner();

        if req.task_payload.trim().is_empty() {
            return Err(Status::invalid_argument("Task payload cannot be empty"));
        }

        let job = if req.job_id.trim().is_empty() {
            Job::new(req.task_payload)
        } else {
            Job::with_id(req.job_id.trim(), req.task_payload)
        };
        let submitted_at = job.submitted_at;
        let job_id = self.coordinator.submit(job).await?;

        Ok(Response::new(SubmitJobResponse {
            job_id,
            submitted_at_ms: to_millis(submitted_at),
        }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let req = request.into_inner();
        let job = self
            .coordinator
            .job(&req.job_id)
            .await
            .ok_or_else(|| Status::not_found(format!("Job not found: {}", req.job_id)))?;

        Ok(Response::new(GetJobStatusResponse {
            job_id: job.id,
            state: ProtoJobState::from(job.state) as i32,
            task_payload: job.task,
            assigned_worker: job.assigned_worker.unwrap_or_default(),
            retry_count: job.retry_count,
            error: job.error.unwrap_or_default(),
            submitted_at_ms: to_millis(job.submitted_at),
            scheduled_at_ms: job.scheduled_at.map(to_millis),
            completed_at_ms: job.completed_at.map(to_millis),
        }))
    }

    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let req = request.into_inner();
        if req.worker_id.trim().is_empty() || req.address.trim().is_empty() {
            return Err(Status::invalid_argument("Worker ID and address are required"));
        }

        self.coordinator
            .register_worker(&req.worker_id, &req.address)
            .await;
        tracing::info!(worker_id = %req.worker_id, address = %req.address, "Worker registered");
        Ok(Response::new(RegisterWorkerResponse {}))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let held = (req.busy && !req.current_job_id.is_empty()).then(|| Assignment {
            job_id: req.current_job_id,
            task: req.current_task_payload,
            scheduled_at: from_millis(req.current_scheduled_at_ms),
        });
        self.coordinator.heartbeat(&req.worker_id, held).await?;
        Ok(Response::new(HeartbeatResponse {}))
    }

    async fn report_completion(
        &self,
        request: Request<ReportCompletionRequest>,
    ) -> Result<Response<ReportCompletionResponse>, Status> {
        let req = request.into_inner();
        let error = Some(req.error).filter(|e| !e.is_empty());
        let acknowledged = self
            .coordinator
            .report_completion(
                &req.worker_id,
                &req.job_id,
                req.success,
                error,
                from_millis(req.completed_at_ms),
            )
            .await?;

        Ok(Response::new(ReportCompletionResponse { acknowledged }))
    }

    async fn list_workers(
        &self,
        _request: Request<ListWorkersRequest>,
    ) -> Result<Response<ListWorkersResponse>, Status> {
        let registry = self.coordinator.registry();
        let workers = registry
            .read()
            .await
            .all()
            .map(|w| WorkerInfo {
                worker_id: w.id.clone(),
                address: w.address.clone(),
                health: HealthState::from(&w.health) as i32,
                busy: w.is_busy(),
                assigned_job: w.assigned_job.clone().unwrap_or_default(),
                last_heartbeat_ms_ago: w.last_heartbeat.elapsed().as_millis() as u64,
            })
            .collect();

        Ok(Response::new(ListWorkersResponse { workers }))
    }
}
