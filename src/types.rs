//! Core data types shared by the registry, arbiter, orchestrator and store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task priority as an integer (higher runs sooner among tied peers).
/// Default is 0. Typical range: -100 to 100.
pub type Priority = i32;

/// Priority constants for convenience.
pub const PRIORITY_HIGH: Priority = 1;
pub const PRIORITY_MEDIUM: Priority = 0;
pub const PRIORITY_LOW: Priority = -1;

/// Parse a priority string ("high", "medium", "low") to an integer.
/// Returns 0 (medium) for unrecognized values.
pub fn parse_priority(s: &str) -> Priority {
    match s.to_lowercase().as_str() {
        "high" => PRIORITY_HIGH,
        "medium" => PRIORITY_MEDIUM,
        "low" => PRIORITY_LOW,
        _ => s.parse().unwrap_or(PRIORITY_MEDIUM),
    }
}

/// Convert priority integer to string representation.
pub fn priority_to_str(p: Priority) -> &'static str {
    if p > 0 {
        "high"
    } else if p < 0 {
        "low"
    } else {
        "medium"
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Paused,
    Queued,
    Completed,
    Cancelled,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Queued,
        TaskStatus::Completed,
        TaskStatus::Cancelled,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "Running",
            TaskStatus::Paused => "Paused",
            TaskStatus::Queued => "Queued",
            TaskStatus::Completed => "Completed",
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::Failed => "Failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "queued" => Some(TaskStatus::Queued),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" | "canceled" => Some(TaskStatus::Cancelled),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses are sinks.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }

    pub fn is_running(&self) -> bool {
        *self == TaskStatus::Running
    }

    pub fn is_queued(&self) -> bool {
        *self == TaskStatus::Queued
    }

    pub fn is_paused(&self) -> bool {
        *self == TaskStatus::Paused
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task behaviour switches chosen at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFlags {
    pub skip_permissions: bool,
    pub remote_session: bool,
    pub headless: bool,
    /// Run-until-done mode: re-invoke the agent for successive iterations.
    pub iterate_until_done: bool,
    /// Writes by this task never queue it; its locks are recorded as ignored.
    pub ignore_file_locks: bool,
    pub use_tool_bus: bool,
    pub spawn_team: bool,
    pub extended_planning: bool,
    pub no_git_write: bool,
    pub plan_only: bool,
    pub auto_decompose: bool,
}

/// Token accounting reported by the agent process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_creation += other.cache_creation;
    }

    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_creation
    }
}

/// A coding-agent execution unit operating on a project's files.
///
/// Plain data: mutation that must be observed goes through
/// [`crate::task::TaskHandle`], which diffs and publishes field changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Random 16-hex-character identifier.
    pub id: String,
    /// Sequential display number assigned by the registry.
    pub number: u64,
    pub description: String,

    // Project snapshot, frozen at creation
    pub project_path: String,
    pub project_name: String,
    pub project_color: Option<String>,

    pub model: Option<String>,
    pub flags: TaskFlags,
    pub allow_interrupts: bool,

    // Iteration tracking
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub consecutive_failures: u32,
    /// Byte offset into the accumulated output where the current iteration began.
    pub last_iteration_output_start: usize,

    pub tokens: TokenUsage,

    pub image_paths: Vec<String>,
    pub generated_image_paths: Vec<String>,

    // Free-text outputs
    pub summary: Option<String>,
    pub completion_summary: Option<String>,
    pub recommendations: Option<String>,
    pub stored_prompt: Option<String>,
    pub full_output: Option<String>,

    pub status: TaskStatus,
    pub created_at: i64,
    /// Start of the current run; refreshed when a queued task is promoted.
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub git_start_hash: Option<String>,

    pub priority: Priority,

    // Batch membership
    pub group_id: Option<String>,
    pub group_name: Option<String>,

    // Hierarchy
    pub parent_task_id: Option<String>,
    pub child_task_ids: Vec<String>,

    /// User-declared ordering: every id must be finished before this task runs.
    pub dependency_task_ids: Vec<String>,
    /// Current file-lock blocker (display only; the arbiter keeps the full set).
    pub blocked_by_task_id: Option<String>,
    pub queued_reason: Option<String>,
}

impl Task {
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn is_queued(&self) -> bool {
        self.status.is_queued()
    }

    pub fn is_paused(&self) -> bool {
        self.status.is_paused()
    }

    /// Elapsed run time in milliseconds, up to `end_time` or `now`.
    pub fn duration_ms(&self, now: i64) -> i64 {
        let end = self.end_time.unwrap_or(now);
        (end - self.start_time).max(0)
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequest {
    pub description: String,
    pub project_path: String,
    pub project_color: Option<String>,
    pub model: Option<String>,
    pub flags: TaskFlags,
    pub priority: Priority,
    /// Iteration cap for run-until-done mode (config default if absent).
    pub max_iterations: Option<u32>,
    pub image_paths: Vec<String>,
    pub dependency_task_ids: Vec<String>,
    pub allow_interrupts: Option<bool>,
    pub git_start_hash: Option<String>,
}

impl TaskRequest {
    pub fn new(description: impl Into<String>, project_path: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            project_path: project_path.into(),
            ..Default::default()
        }
    }
}

/// An ownership claim on a canonical file path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLock {
    pub normalized_path: String,
    /// Path as referenced by the tool call.
    pub original_path: String,
    pub owner_task_id: String,
    pub tool_name: String,
    /// Ignored locks stay visible but never block anyone.
    pub ignored: bool,
    pub locked_at: i64,
}

impl FileLock {
    pub fn status_text(&self) -> &'static str {
        if self.ignored { "Ignored" } else { "Active" }
    }
}

/// Why and on whom a queued task is waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTaskInfo {
    pub task_id: String,
    /// Conflicting normalized path (absent when waiting on dependencies only).
    pub conflicting_path: Option<String>,
    pub original_path: Option<String>,
    pub tool_name: Option<String>,
    /// Blocker shown to the user.
    pub primary_blocker_id: Option<String>,
    /// Every task that must finish before this one may resume.
    pub blocking_task_ids: Vec<String>,
    pub priority: Priority,
    /// Insertion order, used to break priority ties.
    pub sequence: u64,
    pub queued_at: i64,
}
