//! agent-conductor library
//!
//! Runs coding-agent processes as tasks, arbitrates the files they write
//! through per-path locks, and carries each task to a terminal status.

pub mod arbiter;
pub mod cli;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod format;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod subscriptions;
pub mod task;
pub mod types;

pub use arbiter::{FileLockArbiter, LockOutcome, ReleaseReport};
pub use config::Config;
pub use error::{ConductorError, ConductorResult, ErrorCode};
pub use orchestrator::TaskOrchestrator;
pub use task::{TaskHandle, TaskRegistry};
pub use types::{FileLock, Task, TaskFlags, TaskRequest, TaskStatus};
