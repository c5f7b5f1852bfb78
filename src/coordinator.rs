use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::dispatch::{AssignOutcome, Assignment, ProbeHealth, WorkerClient};
use crate::error::{RelayError, Result};
use crate::scheduler::{Job, JobQueue, WorkerRegistry, WorkerSnapshot};
use crate::store::{StatusRecord, StatusStore};

/// Owns the worker registry and the job queue and runs the control loop.
///
/// Lock order is registry, then queue, then job table. No lock is held
/// across a dispatch call or a status store write.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<RwLock<WorkerRegistry>>,
    queue: Arc<RwLock<JobQueue>>,
    /// Jobs that have left the queue: assigned, running or terminal
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    client: Arc<dyn WorkerClient>,
    store: Arc<dyn StatusStore>,
    cancel: CancellationToken,
    started: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A job reserved on a worker, waiting for the worker's answer.
struct Reservation {
    worker_id: String,
    address: String,
    assignment: Assignment,
}

impl Coordinator {
    /// Build a coordinator and register the statically configured workers.
    pub fn new(
        config: CoordinatorConfig,
        client: Arc<dyn WorkerClient>,
        store: Arc<dyn StatusStore>,
    ) -> Self {
        let mut registry = WorkerRegistry::new();
        for entry in &config.workers {
            registry.register(&entry.id, &entry.address);
        }

        Self {
            queue: Arc::new(RwLock::new(JobQueue::with_capacity(config.queue_capacity))),
            registry: Arc::new(RwLock::new(registry)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            config,
            client,
            store,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<RwLock<WorkerRegistry>> {
        self.registry.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Enqueue a job. Fails with `QueueFull` without enqueuing when the queue
    /// is at capacity, and with `DuplicateJob` when the ID is still in flight.
    pub async fn submit(&self, job: Job) -> Result<String> {
        if self.is_stopped() {
            return Err(RelayError::Stopped);
        }

        let mut queue = self.queue.write().await;
        let mut jobs = self.jobs.write().await;
        let in_flight = jobs.get(&job.id).is_some_and(|j| !j.is_terminal());
        if queue.contains(&job.id) || in_flight {
            return Err(RelayError::DuplicateJob(job.id));
        }

        let job_id = job.id.clone();
        queue.push(job)?;
        // a terminal job resubmitted under the same ID starts over
        jobs.remove(&job_id);

        tracing::info!(job_id = %job_id, queued = queue.len(), "Job submitted");
        Ok(job_id)
    }

    pub async fn register_worker(&self, id: &str, address: &str) {
        self.registry.write().await.register(id, address);
    }

    /// Refresh a worker's liveness. `held` is the job the worker says it is
    /// executing; one the registry does not show on that worker is adopted.
    pub async fn heartbeat(&self, worker_id: &str, held: Option<Assignment>) -> Result<()> {
        self.registry.write().await.heartbeat(worker_id)?;
        if let Some(held) = held {
            self.adopt(worker_id, held).await;
        }
        Ok(())
    }

    /// Remove a worker, treating any job it still holds as lost.
    pub async fn remove_worker(&self, worker_id: &str) -> Result<()> {
        let record = self.registry.write().await.remove(worker_id)?;
        if let Some(job_id) = record.assigned_job {
            self.handle_lost_job(worker_id, &job_id).await;
        }
        Ok(())
    }

    /// Record a worker's terminal report, free the worker and persist the
    /// status record.
    ///
    /// Returns false for a stale report: the worker is unknown or no longer
    /// holds the job (it was declared lost and the job moved on). A stale
    /// report writes nothing. Only the first matching report frees the worker.
    pub async fn report_completion(
        &self,
        worker_id: &str,
        job_id: &str,
        success: bool,
        error: Option<String>,
        completed_at: chrono::DateTime<Utc>,
    ) -> Result<bool> {
        let record = {
            let mut registry = self.registry.write().await;
            if registry.assigned_job(worker_id) != Some(job_id) {
                tracing::warn!(worker_id, job_id, "Ignoring stale completion report");
                return Ok(false);
            }
            registry.mark_free(worker_id)?;
            let _ = registry.heartbeat(worker_id);

            let mut jobs = self.jobs.write().await;
            let job = jobs
                .entry(job_id.to_string())
                .or_insert_with(|| Job::adopted(job_id, worker_id, String::new(), completed_at));
            let error = error.unwrap_or_default();
            let finished = if success {
                job.mark_succeeded(completed_at)
            } else {
                job.mark_failed(error.clone(), completed_at)
            };
            tracing::info!(worker_id, job_id, state = %job.state, "Job finished");
            if !finished {
                return Ok(true);
            }

            let scheduled_at = job.scheduled_at.unwrap_or(job.submitted_at);
            if success {
                StatusRecord::success(job_id, scheduled_at, completed_at)
            } else {
                StatusRecord::error(job_id, error, scheduled_at, completed_at)
            }
        };

        if let Err(e) = self.store.upsert(record).await {
            tracing::error!(job_id, error = %e, "Failed to record terminal status");
        }
        Ok(true)
    }

    /// Launch the periodic control loop. Fails if called twice or after `stop`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_stopped() {
            return Err(RelayError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyStarted);
        }

        self.reconcile().await;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_loop().await;
        });
        *self.loop_handle.lock().await = Some(handle);

        tracing::info!(
            interval_ms = self.config.health_check_interval_ms,
            worker_timeout_ms = self.config.worker_timeout_ms,
            "Coordinator started"
        );
        Ok(())
    }

    /// Cancel the control loop and wait for the current iteration to finish.
    /// No job is assigned once this has been called.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Control loop ended abnormally");
            }
        }
        tracing::info!("Coordinator stopped");
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        let queue = self.queue.read().await;
        if let Some(job) = queue.get(job_id) {
            return Some(job.clone());
        }
        self.jobs.read().await.get(job_id).cloned()
    }

    /// Every known job, oldest submission first
    pub async fn jobs(&self) -> Vec<Job> {
        let queue = self.queue.read().await;
        let jobs = self.jobs.read().await;
        let mut all: Vec<Job> = queue.iter().chain(jobs.values()).cloned().collect();
        all.sort_by_key(|j| j.submitted_at);
        all
    }

    pub async fn workers(&self) -> Vec<WorkerSnapshot> {
        self.registry.read().await.snapshots()
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.read().await.len()
    }

    // =========================================================================
    // Control loop
    // =========================================================================

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.config.health_check_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    /// One control-loop iteration: health check, probes, removals, assignment.
    pub async fn tick(&self) {
        if self.is_stopped() {
            return;
        }
        self.check_workers().await;
        self.probe_unhealthy().await;
        self.remove_expired().await;
        self.assign_pending().await;
    }

    /// Demote silent workers and requeue or fail what they were holding.
    async fn check_workers(&self) {
        let lost: Vec<(String, String)> = {
            let mut registry = self.registry.write().await;
            let demoted = registry.check_health(self.config.worker_timeout());
            demoted
                .into_iter()
                .filter_map(|worker_id| {
                    let job_id = registry.mark_free(&worker_id).ok().flatten()?;
                    Some((worker_id, job_id))
                })
                .collect()
        };

        for (worker_id, job_id) in lost {
            self.handle_lost_job(&worker_id, &job_id).await;
        }
    }

    /// A job whose worker vanished goes back to the head of the queue once;
    /// the second loss is terminal. So is any loss of a job whose payload is
    /// unknown, since it could never run anywhere else.
    async fn handle_lost_job(&self, worker_id: &str, job_id: &str) {
        let record = {
            let mut queue = self.queue.write().await;
            let mut jobs = self.jobs.write().await;
            let Some(mut job) = jobs.remove(job_id) else {
                tracing::warn!(worker_id, job_id, "Lost worker held an unknown job");
                return;
            };
            if job.is_terminal() {
                jobs.insert(job_id.to_string(), job);
                return;
            }

            if job.is_replayable() && job.take_retry() {
                tracing::warn!(
                    worker_id,
                    job_id,
                    retry_count = job.retry_count,
                    "Worker lost, requeueing job"
                );
                queue.requeue(job);
                return;
            }

            let reason = if job.is_replayable() {
                "retry budget exhausted"
            } else {
                "task payload unknown, cannot requeue"
            };
            let now = Utc::now();
            let message = format!(
                "worker lost: {} stopped responding while holding the job ({})",
                worker_id, reason
            );
            job.mark_failed(message.clone(), now);
            tracing::error!(worker_id, job_id, reason, "Worker lost, job failed");
            let record = StatusRecord::error(
                job_id,
                message,
                job.scheduled_at.unwrap_or(job.submitted_at),
                now,
            );
            jobs.insert(job_id.to_string(), job);
            record
        };

        if let Err(e) = self.store.upsert(record).await {
            tracing::error!(job_id, error = %e, "Failed to record terminal status");
        }
    }

    /// Actively probe unhealthy workers; a healthy answer counts as a heartbeat.
    async fn probe_unhealthy(&self) {
        let targets = self.registry.read().await.unhealthy_workers();
        if targets.is_empty() {
            return;
        }

        let timeout = self.config.dispatch_timeout();
        let mut probes = JoinSet::new();
        for (worker_id, address) in targets {
            let client = self.client.clone();
            probes.spawn(async move {
                let result =
                    tokio::time::timeout(timeout, client.health_probe(&worker_id, &address)).await;
                (worker_id, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((worker_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(report)) if report.health == ProbeHealth::Healthy => {
                    if self.registry.write().await.heartbeat(&worker_id).is_ok() {
                        tracing::info!(worker_id = %worker_id, busy = report.busy, "Worker answered probe");
                    }
                }
                Ok(Ok(_)) => {
                    tracing::debug!(worker_id = %worker_id, "Worker reports itself unhealthy");
                }
                Ok(Err(e)) => {
                    tracing::debug!(worker_id = %worker_id, error = %e, "Probe failed");
                }
                Err(_) => {
                    tracing::debug!(worker_id = %worker_id, "Probe timed out");
                }
            }
        }
    }

    async fn remove_expired(&self) {
        let removed = {
            let mut registry = self.registry.write().await;
            let expired = registry.expired_unhealthy(Instant::now(), self.config.removal_grace());
            expired
                .into_iter()
                .filter_map(|id| registry.remove(&id).ok())
                .collect::<Vec<_>>()
        };

        for record in removed {
            if let Some(job_id) = record.assigned_job {
                self.handle_lost_job(&record.id, &job_id).await;
            }
        }
    }

    /// Pair free workers with queued jobs until one side runs out.
    ///
    /// A worker that rejects or fails a dispatch sits out the rest of the
    /// tick; otherwise a rejecting worker would be picked again for the same
    /// head job forever.
    async fn assign_pending(&self) {
        let mut skip = HashSet::new();
        loop {
            if self.is_stopped() {
                break;
            }
            let Some(reservation) = self.reserve(&skip).await else {
                break;
            };
            let Reservation {
                worker_id,
                address,
                assignment,
            } = reservation;

            let outcome = tokio::time::timeout(
                self.config.dispatch_timeout(),
                self.client.assign_job(&worker_id, &address, &assignment),
            )
            .await;

            match outcome {
                Ok(Ok(AssignOutcome::Accepted)) => {
                    let mut jobs = self.jobs.write().await;
                    if let Some(job) = jobs.get_mut(&assignment.job_id) {
                        job.mark_running();
                    }
                    tracing::info!(job_id = %assignment.job_id, worker_id = %worker_id, "Job dispatched");
                }
                Ok(Ok(AssignOutcome::Rejected(reason))) => {
                    tracing::warn!(
                        job_id = %assignment.job_id,
                        worker_id = %worker_id,
                        reason = %reason,
                        "Worker rejected job"
                    );
                    self.roll_back(&worker_id, &assignment.job_id, false).await;
                    skip.insert(worker_id);
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        job_id = %assignment.job_id,
                        worker_id = %worker_id,
                        error = %e,
                        "Dispatch failed"
                    );
                    self.roll_back(&worker_id, &assignment.job_id, true).await;
                    skip.insert(worker_id);
                }
                Err(_) => {
                    tracing::warn!(
                        job_id = %assignment.job_id,
                        worker_id = %worker_id,
                        timeout_ms = self.config.dispatch_timeout_ms,
                        "Dispatch timed out"
                    );
                    self.roll_back(&worker_id, &assignment.job_id, true).await;
                    skip.insert(worker_id);
                }
            }
        }
    }

    /// Tentatively bind the head job to the lowest free worker not in `skip`.
    async fn reserve(&self, skip: &HashSet<String>) -> Option<Reservation> {
        let mut registry = self.registry.write().await;
        let worker_id = registry.pick_free_except(skip)?;
        let address = registry.get(&worker_id)?.address.clone();

        let mut queue = self.queue.write().await;
        let mut job = queue.pop()?;
        if let Err(e) = registry.mark_busy(&worker_id, &job.id) {
            tracing::error!(worker_id = %worker_id, job_id = %job.id, error = %e, "Reservation failed");
            queue.requeue(job);
            return None;
        }

        let scheduled_at = Utc::now();
        job.mark_assigned(&worker_id, scheduled_at);
        let assignment = Assignment {
            job_id: job.id.clone(),
            task: job.task.clone(),
            scheduled_at,
        };
        self.jobs.write().await.insert(job.id.clone(), job);

        Some(Reservation {
            worker_id,
            address,
            assignment,
        })
    }

    /// Undo a reservation. The job returns to the head of the queue without
    /// spending its retry budget; it never started on the worker.
    async fn roll_back(&self, worker_id: &str, job_id: &str, demote: bool) {
        let mut registry = self.registry.write().await;
        if registry.assigned_job(worker_id) == Some(job_id) {
            let _ = registry.mark_free(worker_id);
        }
        if demote {
            match registry.mark_unhealthy(worker_id) {
                Ok(true) => tracing::warn!(worker_id, "Worker marked unhealthy after dispatch failure"),
                Ok(false) => {}
                Err(e) => tracing::debug!(worker_id, error = %e, "Worker vanished during dispatch"),
            }
        }

        let mut queue = self.queue.write().await;
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.remove(job_id) {
            if job.is_terminal() {
                jobs.insert(job_id.to_string(), job);
            } else {
                queue.requeue(job);
            }
        }
    }

    /// Re-learn in-flight assignments from the workers themselves.
    ///
    /// Runs before the first tick. A worker that cannot be queried is marked
    /// unhealthy; the reported job (if any) is adopted as that worker's
    /// assignment.
    pub async fn reconcile(&self) {
        let workers: Vec<(String, String)> = self
            .registry
            .read()
            .await
            .all()
            .map(|w| (w.id.clone(), w.address.clone()))
            .collect();
        if workers.is_empty() {
            return;
        }

        let timeout = self.config.dispatch_timeout();
        let mut queries = JoinSet::new();
        for (worker_id, address) in workers {
            let client = self.client.clone();
            queries.spawn(async move {
                let result =
                    tokio::time::timeout(timeout, client.query_job(&worker_id, &address)).await;
                (worker_id, result)
            });
        }

        while let Some(joined) = queries.join_next().await {
            let Ok((worker_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(Some(held))) => self.adopt(&worker_id, held).await,
                Ok(Ok(None)) => {}
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!(worker_id = %worker_id, "Worker unreachable during reconciliation");
                    let _ = self.registry.write().await.mark_unhealthy(&worker_id);
                }
            }
        }
    }

    /// Make `held` the worker's assignment, as the worker reports it.
    ///
    /// A queued copy leaves the queue, an unknown job is created as Running.
    /// Nothing changes when the job is terminal, held by another worker, or
    /// the worker is already assigned something else.
    async fn adopt(&self, worker_id: &str, held: Assignment) {
        let job_id = held.job_id.as_str();
        let mut registry = self.registry.write().await;
        match registry.assigned_job(worker_id) {
            Some(current) if current == job_id => return,
            Some(current) => {
                tracing::warn!(
                    worker_id,
                    job_id,
                    assigned = current,
                    "Worker reports a job other than its assignment, not adopting"
                );
                return;
            }
            None => {}
        }
        if let Some(holder) = registry.worker_for_job(job_id) {
            tracing::warn!(
                worker_id,
                job_id,
                holder = %holder.id,
                "Job already held by another worker, not adopting"
            );
            return;
        }

        let mut queue = self.queue.write().await;
        let mut jobs = self.jobs.write().await;
        if jobs.get(job_id).is_some_and(Job::is_terminal) {
            tracing::debug!(worker_id, job_id, "Reported job already finished, not adopting");
            return;
        }
        if let Err(e) = registry.mark_busy(worker_id, job_id) {
            tracing::warn!(worker_id, job_id, error = %e, "Could not adopt job");
            return;
        }

        let job = match queue.take(job_id).or_else(|| jobs.remove(job_id)) {
            Some(mut job) => {
                job.mark_assigned(worker_id, held.scheduled_at);
                job.mark_running();
                job
            }
            None => Job::adopted(job_id, worker_id, held.task.clone(), held.scheduled_at),
        };
        tracing::info!(worker_id, job_id, "Adopted in-flight job from worker");
        jobs.insert(job_id.to_string(), job);
    }
}
