//! Structured error types for orchestration operations.

use serde::Serialize;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Recoverable: resolved by queueing or retrying
    LockConflict,
    DependencyUnsatisfied,
    TransientRateOrTokenLimit,

    // Fatal for the task
    ProcessLaunchFailure,

    // Silently dropped by the arbiter, never surfaced to callers
    MalformedToolFragment,

    // Lookup / validation
    TaskNotFound,
    UnknownDependency,
    DependencyCycle,
    InvalidState,

    // Infrastructure
    Persistence,
    Config,
    Internal,
}

impl ErrorCode {
    /// Whether a failure with this code leaves the task able to continue
    /// (queued or retried) rather than ending it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::LockConflict
                | ErrorCode::DependencyUnsatisfied
                | ErrorCode::TransientRateOrTokenLimit
        )
    }
}

/// Structured error for orchestrator, arbiter and store operations.
#[derive(Debug, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ConductorError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ConductorError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            task_id: None,
            details: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    pub fn lock_conflict(task_id: &str, path: &str, owner: &str) -> Self {
        Self::new(
            ErrorCode::LockConflict,
            format!("{} is locked by task {}", path, owner),
        )
        .with_task(task_id)
    }

    pub fn deps_not_satisfied(task_id: &str, blockers: &[String]) -> Self {
        Self::new(
            ErrorCode::DependencyUnsatisfied,
            format!("Task blocked by: {}", blockers.join(", ")),
        )
        .with_task(task_id)
    }

    pub fn transient_limit(task_id: &str, attempts: u32) -> Self {
        Self::new(
            ErrorCode::TransientRateOrTokenLimit,
            format!("Rate or token limit hit after {} retries", attempts),
        )
        .with_task(task_id)
    }

    pub fn launch_failed(task_id: &str, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ProcessLaunchFailure,
            format!("Failed to launch agent process: {}", err),
        )
        .with_task(task_id)
    }

    pub fn malformed_fragment(reason: &str) -> Self {
        Self::new(ErrorCode::MalformedToolFragment, reason)
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(
            ErrorCode::TaskNotFound,
            format!("Task not found: {}", task_id),
        )
        .with_task(task_id)
    }

    pub fn unknown_dependency(task_id: &str, dependency_id: &str) -> Self {
        Self::new(
            ErrorCode::UnknownDependency,
            format!(
                "Dependency {} must be declared before task {}",
                dependency_id, task_id
            ),
        )
        .with_task(task_id)
    }

    pub fn dependency_cycle(blocker: &str, blocked: &str) -> Self {
        Self::new(
            ErrorCode::DependencyCycle,
            format!(
                "Adding dependency {} -> {} would create a cycle",
                blocker, blocked
            ),
        )
        .with_task(blocked)
    }

    pub fn invalid_state(task_id: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidState, reason).with_task(task_id)
    }

    pub fn persistence(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Persistence, err.to_string())
    }

    pub fn config(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Config, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Internal, err.to_string())
    }
}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for ConductorError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ConductorError>() {
            Ok(conductor_err) => conductor_err,
            Err(err) => ConductorError::internal(err),
        }
    }
}

impl From<rusqlite::Error> for ConductorError {
    fn from(err: rusqlite::Error) -> Self {
        ConductorError::persistence(err)
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(err: serde_json::Error) -> Self {
        ConductorError::persistence(err)
    }
}

impl From<std::io::Error> for ConductorError {
    fn from(err: std::io::Error) -> Self {
        ConductorError::internal(err)
    }
}

/// Result type for conductor operations.
pub type ConductorResult<T> = std::result::Result<T, ConductorError>;
