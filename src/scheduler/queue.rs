use std::collections::VecDeque;

use crate::error::{RelayError, Result};
use crate::scheduler::job::Job;

const DEFAULT_CAPACITY: usize = 1024;

/// FIFO of jobs waiting for a worker.
///
/// Submissions are rejected once `capacity` jobs are waiting. Requeued jobs go
/// to the head and are never rejected: they were already admitted once and
/// dropping them would lose work.
#[derive(Debug)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
    capacity: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            capacity,
        }
    }

    /// Append a job to the tail. Returns `QueueFull` without enqueuing when at capacity.
    pub fn push(&mut self, mut job: Job) -> Result<()> {
        if self.is_full() {
            return Err(RelayError::QueueFull);
        }
        job.mark_queued();
        self.jobs.push_back(job);
        Ok(())
    }

    /// Remove and return the head, if any. Never waits.
    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Put a job back at the head so it runs before newer submissions.
    ///
    /// Retry accounting lives on the job itself (`Job::take_retry`); callers
    /// decide whether a requeue consumes the budget.
    pub fn requeue(&mut self, mut job: Job) {
        job.mark_queued();
        tracing::debug!(job_id = %job.id, retry_count = job.retry_count, "Job requeued at head");
        self.jobs.push_front(job);
    }

    /// Pull a specific job out of line, wherever it is waiting.
    pub fn take(&mut self, job_id: &str) -> Option<Job> {
        let index = self.jobs.iter().position(|j| j.id == job_id)?;
        self.jobs.remove(index)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.iter().any(|j| j.id == job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    /// Waiting jobs in dispatch order
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobState;

    #[test]
    fn push_pop_is_fifo() {
        let mut queue = JobQueue::with_capacity(4);
        queue.push(Job::with_id("a", "t")).unwrap();
        queue.push(Job::with_id("b", "t")).unwrap();
        queue.push(Job::with_id("c", "t")).unwrap();

        assert_eq!(queue.pop().unwrap().id, "a");
        assert_eq!(queue.pop().unwrap().id, "b");
        assert_eq!(queue.pop().unwrap().id, "c");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn push_marks_job_queued() {
        let mut queue = JobQueue::new();
        queue.push(Job::with_id("a", "t")).unwrap();
        assert_eq!(queue.get("a").unwrap().state, JobState::Queued);
    }

    #[test]
    fn push_rejects_when_full() {
        let mut queue = JobQueue::with_capacity(1);
        queue.push(Job::with_id("a", "t")).unwrap();

        let err = queue.push(Job::with_id("b", "t")).unwrap_err();
        assert!(matches!(err, RelayError::QueueFull));
        assert_eq!(queue.len(), 1);
        assert!(!queue.contains("b"));
    }

    #[test]
    fn requeue_goes_to_head() {
        let mut queue = JobQueue::with_capacity(4);
        queue.push(Job::with_id("a", "t")).unwrap();
        queue.push(Job::with_id("b", "t")).unwrap();

        let mut lost = Job::with_id("lost", "t");
        lost.mark_assigned("w1", chrono::Utc::now());
        queue.requeue(lost);

        let head = queue.pop().unwrap();
        assert_eq!(head.id, "lost");
        assert_eq!(head.state, JobState::Queued);
        assert!(head.assigned_worker.is_none());
        assert_eq!(queue.pop().unwrap().id, "a");
    }

    #[test]
    fn take_removes_from_the_middle() {
        let mut queue = JobQueue::with_capacity(4);
        queue.push(Job::with_id("a", "t")).unwrap();
        queue.push(Job::with_id("b", "t")).unwrap();
        queue.push(Job::with_id("c", "t")).unwrap();

        assert_eq!(queue.take("b").unwrap().id, "b");
        assert!(queue.take("b").is_none());
        assert_eq!(queue.pop().unwrap().id, "a");
        assert_eq!(queue.pop().unwrap().id, "c");
    }

    #[test]
    fn requeue_ignores_capacity() {
        let mut queue = JobQueue::with_capacity(1);
        queue.push(Job::with_id("a", "t")).unwrap();
        queue.requeue(Job::with_id("b", "t"));
        assert_eq!(queue.len(), 2);
        assert!(queue.is_full());
    }
}
