use std::time::Duration;

use chrono::{DateTime, Utc};
use tonic::transport::Channel;

use crate::error::{RelayError, Result};
use crate::grpc::client::coordinator_client_lazy;
use crate::grpc::to_millis;
use crate::proto::coordinator_service_client::CoordinatorServiceClient;
use crate::proto::ReportCompletionRequest;

const REPORT_ATTEMPTS: u32 = 5;
const REPORT_BACKOFF: Duration = Duration::from_millis(200);

/// Terminal outcome of one job, as sent back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub worker_id: String,
    pub job_id: String,
    pub success: bool,
    /// Empty on success
    pub error: String,
    pub completed_at: DateTime<Utc>,
}

#[tonic::async_trait]
pub trait CompletionReporter: Send + Sync {
    async fn report(&self, report: CompletionReport) -> Result<()>;
}

/// Sends completion reports over gRPC, retrying transport failures.
///
/// A report the coordinator answers with `acknowledged = false` is stale and
/// is not retried.
pub struct GrpcCompletionReporter {
    client: CoordinatorServiceClient<Channel>,
    attempts: u32,
    backoff: Duration,
}

impl GrpcCompletionReporter {
    pub fn new(coordinator_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: coordinator_client_lazy(coordinator_url, timeout)?,
            attempts: REPORT_ATTEMPTS,
            backoff: REPORT_BACKOFF,
        })
    }

    pub fn with_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }
}

#[tonic::async_trait]
impl CompletionReporter for GrpcCompletionReporter {
    async fn report(&self, report: CompletionReport) -> Result<()> {
        let request = ReportCompletionRequest {
            worker_id: report.worker_id.clone(),
            job_id: report.job_id.clone(),
            success: report.success,
            error: report.error.clone(),
            completed_at_ms: to_millis(report.completed_at),
        };

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            let mut client = self.client.clone();
            match client.report_completion(request.clone()).await {
                Ok(response) => {
                    if !response.into_inner().acknowledged {
                        tracing::warn!(job_id = %report.job_id, "Coordinator treated completion report as stale");
                    }
                    return Ok(());
                }
                Err(status) => {
                    tracing::debug!(job_id = %report.job_id, attempt, error = %status, "Completion report failed");
                    last_error = Some(status);
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        Err(last_error
            .map(RelayError::Grpc)
            .unwrap_or_else(|| RelayError::Internal("no report attempt made".to_string())))
    }
}
