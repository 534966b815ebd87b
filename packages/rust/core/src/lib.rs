//! Pipeline dispatch and orchestration for pipehub.
//!
//! This crate ties together the task registry, worker pool, and readiness
//! prober into the top-level [`Dispatcher`], and provides the command-backed
//! handler bootstrap used by the CLI.

pub mod dispatcher;
pub mod handlers;
pub mod progress;

pub use dispatcher::{Dispatcher, PipelineOutcome};
pub use handlers::register_command_tasks;
pub use progress::{ProgressReporter, SilentProgress};
