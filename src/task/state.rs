//! Task creation and status transitions.

use crate::db::now_ms;
use crate::types::{Task, TaskFlags, TaskStatus, TokenUsage, PRIORITY_MEDIUM};
use uuid::Uuid;

/// Generate a random 16-hex-character task id.
pub fn generate_task_id() -> String {
    let (hi, lo) = Uuid::new_v4().as_u64_pair();
    format!("{:016x}", hi ^ lo.rotate_left(17))
}

/// Last path component of the project path, or "" when there is none.
pub fn project_name_of(project_path: &str) -> String {
    let trimmed = project_path.trim_end_matches(['/', '\\']);
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string()
}

impl Task {
    /// Create a running task with fresh id and timestamps.
    ///
    /// The project path is captured verbatim; nothing in the crate rewrites it
    /// afterwards.
    pub fn create(description: &str, project_path: &str, flags: TaskFlags) -> Task {
        let now = now_ms();
        Task {
            id: generate_task_id(),
            number: 0,
            description: description.to_string(),
            project_path: project_path.to_string(),
            project_name: project_name_of(project_path),
            project_color: None,
            model: None,
            flags,
            allow_interrupts: true,
            current_iteration: 1,
            max_iterations: 1,
            consecutive_failures: 0,
            last_iteration_output_start: 0,
            tokens: TokenUsage::default(),
            image_paths: Vec::new(),
            generated_image_paths: Vec::new(),
            summary: None,
            completion_summary: None,
            recommendations: None,
            stored_prompt: None,
            full_output: None,
            status: TaskStatus::Running,
            created_at: now,
            start_time: now,
            end_time: None,
            git_start_hash: None,
            priority: PRIORITY_MEDIUM,
            group_id: None,
            group_name: None,
            parent_task_id: None,
            child_task_ids: Vec::new(),
            dependency_task_ids: Vec::new(),
            blocked_by_task_id: None,
            queued_reason: None,
        }
    }

    /// Move to `new_status`. Returns `false` without touching anything when
    /// the task is already finished or already in that status.
    pub fn transition(&mut self, new_status: TaskStatus) -> bool {
        if self.is_finished() || self.status == new_status {
            return false;
        }
        self.status = new_status;
        if new_status.is_finished() {
            self.end_time = Some(now_ms());
        }
        true
    }

    /// Canonical entry into the run-until-done loop.
    pub fn prepare_for_iterative_start(&mut self) {
        self.flags.skip_permissions = true;
        self.current_iteration = 1;
        self.consecutive_failures = 0;
        self.last_iteration_output_start = 0;
    }
}
