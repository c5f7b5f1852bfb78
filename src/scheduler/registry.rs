use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{RelayError, Result};

/// Health of a registered worker.
///
/// `Removed` is only ever observed on the record handed back by
/// [`WorkerRegistry::remove`]; the registry never stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Healthy,
    Unhealthy { since: Instant },
    Removed,
}

impl WorkerHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, WorkerHealth::Healthy)
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkerHealth::Healthy => "healthy",
            WorkerHealth::Unhealthy { .. } => "unhealthy",
            WorkerHealth::Removed => "removed",
        }
    }
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Worker state tracking
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub address: String,
    pub health: WorkerHealth,
    pub last_heartbeat: Instant,
    /// `Some` exactly when the worker is busy
    pub assigned_job: Option<String>,
}

impl WorkerRecord {
    fn new(id: String, address: String, now: Instant) -> Self {
        Self {
            id,
            address,
            health: WorkerHealth::Healthy,
            last_heartbeat: now,
            assigned_job: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.assigned_job.is_some()
    }

    pub fn is_free(&self) -> bool {
        self.health.is_healthy() && !self.is_busy()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            health: self.health.label().to_string(),
            busy: self.is_busy(),
            assigned_job: self.assigned_job.clone(),
            last_heartbeat_ms_ago: self.last_heartbeat.elapsed().as_millis() as u64,
        }
    }
}

/// Serializable view of a worker for status APIs.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub address: String,
    pub health: String,
    pub busy: bool,
    pub assigned_job: Option<String>,
    pub last_heartbeat_ms_ago: u64,
}

/// Single source of truth for worker existence and state.
///
/// Callers wrap it in one lock covering the whole map and must not hold that
/// lock across network calls. Iteration is ordered by worker ID, which makes
/// [`WorkerRegistry::pick_free`] deterministic.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, WorkerRecord>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a worker in Healthy state with a fresh heartbeat.
    ///
    /// Re-registering an existing ID keeps its current assignment so a worker
    /// that restarts its registration loop mid-job is not double-booked.
    pub fn register(&mut self, id: &str, address: &str) {
        self.register_at(id, address, Instant::now());
    }

    pub fn register_at(&mut self, id: &str, address: &str, now: Instant) {
        let assigned_job = self.workers.get(id).and_then(|w| w.assigned_job.clone());
        let mut record = WorkerRecord::new(id.to_string(), address.to_string(), now);
        record.assigned_job = assigned_job;
        self.workers.insert(id.to_string(), record);
        tracing::info!(worker_id = id, address, "Worker registered");
    }

    pub fn heartbeat(&mut self, id: &str) -> Result<()> {
        self.heartbeat_at(id, Instant::now())
    }

    pub fn heartbeat_at(&mut self, id: &str, now: Instant) -> Result<()> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| RelayError::WorkerNotFound(id.to_string()))?;
        worker.last_heartbeat = now;
        if !worker.health.is_healthy() {
            tracing::info!(worker_id = id, "Worker healthy again");
            worker.health = WorkerHealth::Healthy;
        }
        Ok(())
    }

    /// Demote every Healthy worker whose last heartbeat is older than
    /// `timeout`. Returns the IDs that changed state, in ID order.
    pub fn check_health(&mut self, timeout: Duration) -> Vec<String> {
        self.check_health_at(Instant::now(), timeout)
    }

    pub fn check_health_at(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut demoted = Vec::new();
        for worker in self.workers.values_mut() {
            if !worker.health.is_healthy() {
                continue;
            }
            let silence = now.saturating_duration_since(worker.last_heartbeat);
            if silence > timeout {
                worker.health = WorkerHealth::Unhealthy { since: now };
                tracing::warn!(
                    worker_id = %worker.id,
                    silence_ms = silence.as_millis() as u64,
                    "Worker missed heartbeats, marked unhealthy"
                );
                demoted.push(worker.id.clone());
            }
        }
        demoted
    }

    /// Demote a worker immediately, e.g. after a dispatch timeout.
    /// Returns true if the worker was Healthy before the call.
    pub fn mark_unhealthy(&mut self, id: &str) -> Result<bool> {
        self.mark_unhealthy_at(id, Instant::now())
    }

    pub fn mark_unhealthy_at(&mut self, id: &str, now: Instant) -> Result<bool> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| RelayError::WorkerNotFound(id.to_string()))?;
        if worker.health.is_healthy() {
            worker.health = WorkerHealth::Unhealthy { since: now };
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete a worker. A Healthy worker is forced through Unhealthy first.
    /// The returned record carries `WorkerHealth::Removed`.
    pub fn remove(&mut self, id: &str) -> Result<WorkerRecord> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| RelayError::WorkerNotFound(id.to_string()))?;
        if worker.health.is_healthy() {
            worker.health = WorkerHealth::Unhealthy {
                since: Instant::now(),
            };
        }
        let mut record = self
            .workers
            .remove(id)
            .ok_or_else(|| RelayError::WorkerNotFound(id.to_string()))?;
        record.health = WorkerHealth::Removed;
        tracing::info!(worker_id = id, "Worker removed");
        Ok(record)
    }

    /// Unhealthy workers whose demotion is older than `grace`.
    pub fn expired_unhealthy(&self, now: Instant, grace: Duration) -> Vec<String> {
        self.workers
            .values()
            .filter(|w| match w.health {
                WorkerHealth::Unhealthy { since } => now.saturating_duration_since(since) > grace,
                _ => false,
            })
            .map(|w| w.id.clone())
            .collect()
    }

    /// One Healthy, non-busy worker; lowest ID wins.
    pub fn pick_free(&self) -> Option<String> {
        self.pick_free_except(&HashSet::new())
    }

    /// Like [`pick_free`](Self::pick_free), passing over the `skip` IDs.
    pub fn pick_free_except(&self, skip: &HashSet<String>) -> Option<String> {
        self.workers
            .values()
            .find(|w| w.is_free() && !skip.contains(&w.id))
            .map(|w| w.id.clone())
    }

    pub fn mark_busy(&mut self, id: &str, job_id: &str) -> Result<()> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| RelayError::WorkerNotFound(id.to_string()))?;
        if let Some(current) = &worker.assigned_job {
            return Err(RelayError::AlreadyBusy {
                worker_id: id.to_string(),
                job_id: current.clone(),
            });
        }
        worker.assigned_job = Some(job_id.to_string());
        Ok(())
    }

    /// Clear the busy flag. Returns the job the worker was holding, if any.
    pub fn mark_free(&mut self, id: &str) -> Result<Option<String>> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| RelayError::WorkerNotFound(id.to_string()))?;
        Ok(worker.assigned_job.take())
    }

    pub fn get(&self, id: &str) -> Option<&WorkerRecord> {
        self.workers.get(id)
    }

    pub fn assigned_job(&self, id: &str) -> Option<&str> {
        self.workers.get(id).and_then(|w| w.assigned_job.as_deref())
    }

    /// The worker currently holding `job_id`, if any
    pub fn worker_for_job(&self, job_id: &str) -> Option<&WorkerRecord> {
        self.workers
            .values()
            .find(|w| w.assigned_job.as_deref() == Some(job_id))
    }

    pub fn unhealthy_workers(&self) -> Vec<(String, String)> {
        self.workers
            .values()
            .filter(|w| !w.health.is_healthy())
            .map(|w| (w.id.clone(), w.address.clone()))
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers.values().map(WorkerRecord::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
