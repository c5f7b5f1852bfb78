use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{AssignOutcome, Assignment};
use crate::error::ExecutionError;
use crate::worker::executor::ContainerEngine;
use crate::worker::fetch::{recipe_url, RecipeSource};
use crate::worker::reporter::{CompletionReport, CompletionReporter};

const RECIPE_FILE: &str = "Dockerfile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Fetching,
    Building,
    Running,
    Reporting,
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnginePhase::Idle => write!(f, "idle"),
            EnginePhase::Fetching => write!(f, "fetching"),
            EnginePhase::Building => write!(f, "building"),
            EnginePhase::Running => write!(f, "running"),
            EnginePhase::Reporting => write!(f, "reporting"),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    current: Option<Assignment>,
    draining: bool,
}

/// Runs at most one job at a time: fetch the recipe, build an image named
/// after the job, run it, report the outcome back.
///
/// The terminal record is persisted by the coordinator once it acknowledges
/// the report; the engine writes none itself.
///
/// A failing job never takes the engine down. The one exception is a worker
/// that cannot create a local build context: it reports the failure and then
/// cancels its `fatal` token.
pub struct ExecutionEngine {
    worker_id: String,
    slot: Mutex<Slot>,
    phase: watch::Sender<EnginePhase>,
    /// Executions not yet done reporting; can briefly be 2 while an old job
    /// reports and a new one starts
    in_flight: watch::Sender<usize>,
    recipes: Arc<dyn RecipeSource>,
    containers: Arc<dyn ContainerEngine>,
    reporter: Arc<dyn CompletionReporter>,
    fatal: CancellationToken,
    scratch_dir: Option<PathBuf>,
}

impl ExecutionEngine {
    pub fn new(
        worker_id: impl Into<String>,
        recipes: Arc<dyn RecipeSource>,
        containers: Arc<dyn ContainerEngine>,
        reporter: Arc<dyn CompletionReporter>,
    ) -> Self {
        let (phase, _) = watch::channel(EnginePhase::Idle);
        let (in_flight, _) = watch::channel(0);
        Self {
            worker_id: worker_id.into(),
            slot: Mutex::new(Slot::default()),
            phase,
            in_flight,
            recipes,
            containers,
            reporter,
            fatal: CancellationToken::new(),
            scratch_dir: None,
        }
    }

    /// Create build contexts under `dir` instead of the system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase.borrow()
    }

    /// Cancelled when the worker can no longer execute jobs at all.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    pub async fn current_job(&self) -> Option<String> {
        self.slot.lock().await.current.as_ref().map(|a| a.job_id.clone())
    }

    /// The held job with its payload, as reported by QueryJob and heartbeats
    pub async fn current_assignment(&self) -> Option<Assignment> {
        self.slot.lock().await.current.clone()
    }

    pub async fn is_busy(&self) -> bool {
        self.slot.lock().await.current.is_some()
    }

    /// True while the worker is willing to take new jobs.
    pub async fn is_accepting(&self) -> bool {
        !self.fatal.is_cancelled() && !self.slot.lock().await.draining
    }

    /// Accept a job if idle and start executing it in the background.
    pub async fn try_accept(self: &Arc<Self>, assignment: Assignment) -> AssignOutcome {
        {
            let mut slot = self.slot.lock().await;
            if let Some(current) = &slot.current {
                return AssignOutcome::Rejected(format!("busy with job {}", current.job_id));
            }
            if slot.draining || self.fatal.is_cancelled() {
                return AssignOutcome::Rejected("worker is shutting down".to_string());
            }
            slot.current = Some(assignment.clone());
            self.phase.send_replace(EnginePhase::Fetching);
            self.in_flight.send_modify(|n| *n += 1);
        }

        tracing::info!(worker_id = %self.worker_id, job_id = %assignment.job_id, "Job accepted");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(assignment).await;
        });
        AssignOutcome::Accepted
    }

    /// Stop accepting jobs; the current one (if any) still runs to the end.
    pub async fn begin_drain(&self) {
        self.slot.lock().await.draining = true;
    }

    /// Resolve once every accepted job has finished and been reported.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Drive one accepted job through every stage and report it.
    ///
    /// The slot must already hold `assignment`.
    async fn execute(&self, assignment: Assignment) {
        let job_id = assignment.job_id.clone();
        let outcome = self.run_stages(&assignment).await;

        self.phase.send_replace(EnginePhase::Reporting);
        let report = CompletionReport {
            worker_id: self.worker_id.clone(),
            job_id: job_id.clone(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string).unwrap_or_default(),
            completed_at: Utc::now(),
        };
        match &outcome {
            Ok(()) => tracing::info!(worker_id = %self.worker_id, job_id = %job_id, "Job succeeded"),
            Err(e) => tracing::warn!(worker_id = %self.worker_id, job_id = %job_id, error = %e, "Job failed"),
        }

        // free the slot before calling back so the coordinator's next
        // assignment is not rejected as busy
        self.slot.lock().await.current = None;
        self.phase.send_replace(EnginePhase::Idle);

        if let Err(e) = self.reporter.report(report).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to report completion");
        }

        if let Err(e) = &outcome {
            if e.is_fatal() {
                tracing::error!(worker_id = %self.worker_id, error = %e, "Worker cannot execute jobs, shutting down");
                self.fatal.cancel();
            }
        }
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn run_stages(&self, assignment: &Assignment) -> Result<(), ExecutionError> {
        let url = recipe_url(&assignment.task)?;
        tracing::debug!(job_id = %assignment.job_id, url = %url, "Fetching recipe");
        let recipe = self.recipes.fetch(&url).await?;

        self.phase.send_replace(EnginePhase::Building);
        let context = BuildContext::create(self.scratch_dir.as_deref(), &recipe).await?;
        let image = image_name(&assignment.job_id);
        self.containers
            .build(&image, &context.recipe_path(), context.path())
            .await?;

        self.phase.send_replace(EnginePhase::Running);
        let result = self.containers.run(&image).await;
        self.containers.remove(&image).await;
        result
    }
}

/// A private directory holding the fetched recipe. Removed on drop.
struct BuildContext {
    dir: TempDir,
}

impl BuildContext {
    async fn create(parent: Option<&Path>, recipe: &[u8]) -> Result<Self, ExecutionError> {
        let dir = match parent {
            Some(parent) => tempfile::Builder::new().prefix("jobrelay-").tempdir_in(parent),
            None => tempfile::Builder::new().prefix("jobrelay-").tempdir(),
        }
        .map_err(|e| ExecutionError::Context(e.to_string()))?;

        let context = Self { dir };
        tokio::fs::write(context.recipe_path(), recipe)
            .await
            .map_err(|e| ExecutionError::Context(format!("writing recipe: {}", e)))?;
        Ok(context)
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn recipe_path(&self) -> PathBuf {
        self.dir.path().join(RECIPE_FILE)
    }
}

/// Deterministic image name for a job.
///
/// Docker references are lowercase `[a-z0-9._-]`; IDs that need rewriting get
/// a hash suffix so two distinct IDs never map to the same image.
pub fn image_name(job_id: &str) -> String {
    let sanitized: String = job_id
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();

    if sanitized == job_id {
        format!("job-image-{}", sanitized)
    } else {
        format!("job-image-{}-{:08x}", sanitized, fnv1a(job_id.as_bytes()))
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_plain_id() {
        assert_eq!(image_name("job-42"), "job-image-job-42");
    }

    #[test]
    fn image_name_is_deterministic() {
        assert_eq!(image_name("Job/42"), image_name("Job/42"));
    }

    #[test]
    fn image_name_sanitizes_without_collisions() {
        let upper = image_name("ABC");
        let lower = image_name("abc");
        assert!(upper.starts_with("job-image-abc-"));
        assert_ne!(upper, lower);
        assert!(upper
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c)));
    }

    #[test]
    fn phase_display() {
        assert_eq!(EnginePhase::Idle.to_string(), "idle");
        assert_eq!(EnginePhase::Reporting.to_string(), "reporting");
    }
}
