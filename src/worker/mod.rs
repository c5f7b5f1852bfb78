//! Worker side: accepts one job at a time and executes it.
//!
//! # Components
//!
//! - [`ExecutionEngine`]: the single job slot and the execution pipeline
//! - [`fetch`]: recipe retrieval ([`RecipeSource`], HTTP by default)
//! - [`executor`]: image build and run ([`ContainerEngine`], Docker by default)
//! - [`reporter`]: completion reports back to the coordinator
//! - [`heartbeat`]: registration and keep-alive
//!
//! # Execution Flow
//!
//! 1. The coordinator calls AssignJob; [`ExecutionEngine::try_accept`] rejects
//!    when a job is already held
//! 2. The recipe URL is read from the task payload and fetched
//! 3. The recipe is written into a fresh build context and built as
//!    `job-image-<job id>`
//! 4. The image runs to completion, then is removed
//! 5. The slot is freed and the outcome is reported to the coordinator,
//!    which persists the terminal record if the report is still current

pub mod engine;
pub mod executor;
pub mod fetch;
pub mod heartbeat;
pub mod reporter;

pub use engine::{EnginePhase, ExecutionEngine};
pub use executor::{ContainerEngine, DockerEngine};
pub use fetch::{HttpRecipeSource, RecipeSource};
pub use heartbeat::HeartbeatSender;
pub use reporter::{CompletionReport, CompletionReporter, GrpcCompletionReporter};
