use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Job queue is at capacity")]
    QueueFull,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already known: {0}")]
    DuplicateJob(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker {worker_id} is already busy with job {job_id}")]
    AlreadyBusy { worker_id: String, job_id: String },

    #[error("Worker {worker_id} unreachable: {reason}")]
    WorkerUnreachable { worker_id: String, reason: String },

    #[error("Worker {worker_id} rejected job: {reason}")]
    JobRejected { worker_id: String, reason: String },

    #[error("Coordinator already started")]
    AlreadyStarted,

    #[error("Coordinator stopped")]
    Stopped,

    #[error("Status store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RelayError> for tonic::Status {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::QueueFull => tonic::Status::resource_exhausted(err.to_string()),
            RelayError::JobNotFound(_) | RelayError::WorkerNotFound(_) => {
                tonic::Status::not_found(err.to_string())
            }
            RelayError::DuplicateJob(_) | RelayError::Config(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            RelayError::AlreadyBusy { .. } | RelayError::JobRejected { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            }
            RelayError::Stopped | RelayError::WorkerUnreachable { .. } => {
                tonic::Status::unavailable(err.to_string())
            }
            RelayError::Grpc(status) => status,
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Stage failures inside the worker's execution engine.
///
/// None of these stop the worker, except `Context`: a worker that cannot
/// create a local build context reports the job and then shuts down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("run failed: {0}")]
    Run(String),

    #[error("build context unavailable: {0}")]
    Context(String),
}

impl ExecutionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::Context(_))
    }
}
