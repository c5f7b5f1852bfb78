pub mod job;
pub mod queue;
pub mod registry;

pub use job::{Job, JobState, MAX_AUTOMATIC_REQUEUES};
pub use queue::JobQueue;
pub use registry::{WorkerHealth, WorkerRecord, WorkerRegistry, WorkerSnapshot};
