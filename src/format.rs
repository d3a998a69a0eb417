//! Output formatting utilities for markdown and JSON.

use crate::types::{priority_to_str, Task, TaskStatus};
use serde::Serialize;

/// Output format for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Markdown,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(OutputFormat::Json),
            "markdown" | "md" => Some(OutputFormat::Markdown),
            _ => None,
        }
    }
}

/// Format a single task as markdown.
pub fn format_task_markdown(task: &Task) -> String {
    let mut md = String::new();

    md.push_str(&format!("## Task #{}: {}\n", task.number, first_line(&task.description)));
    md.push_str(&format!("- **id**: `{}`\n", task.id));
    md.push_str(&format!("- **status**: {}\n", task.status));
    md.push_str(&format!("- **priority**: {}\n", priority_to_str(task.priority)));

    if !task.project_path.is_empty() {
        md.push_str(&format!("- **project**: {} (`{}`)\n", task.project_name, task.project_path));
    }

    if let Some(ref model) = task.model {
        md.push_str(&format!("- **model**: {}\n", model));
    }

    if task.flags.iterate_until_done {
        md.push_str(&format!(
            "- **iteration**: {}/{}\n",
            task.current_iteration, task.max_iterations
        ));
    }

    if let Some(ref group) = task.group_name {
        md.push_str(&format!("- **group**: {}\n", group));
    }

    if let Some(ref parent_id) = task.parent_task_id {
        md.push_str(&format!("- **parent_id**: `{}`\n", parent_id));
    }

    if !task.dependency_task_ids.is_empty() {
        let deps: Vec<String> = task.dependency_task_ids.iter().map(|id| format!("`{}`", id)).collect();
        md.push_str(&format!("- **depends_on**: {}\n", deps.join(", ")));
    }

    if let Some(ref reason) = task.queued_reason {
        md.push_str(&format!("- **queued**: {}\n", reason));
    }

    if task.tokens.total() > 0 {
        md.push_str(&format!(
            "- **tokens**: {} in / {} out / {} cache read / {} cache write\n",
            task.tokens.input, task.tokens.output, task.tokens.cache_read, task.tokens.cache_creation
        ));
    }

    if let Some(ref summary) = task.summary {
        md.push_str("\n### Summary\n");
        md.push_str(summary);
        md.push('\n');
    }

    if let Some(ref completion) = task.completion_summary {
        md.push_str("\n```\n");
        md.push_str(completion);
        md.push_str("\n```\n");
    }

    md
}

/// Format a list of tasks as markdown, grouped by status.
pub fn format_tasks_markdown(title: &str, tasks: &[Task]) -> String {
    let mut md = String::new();

    md.push_str(&format!("# {} ({})\n\n", title, tasks.len()));

    // Live statuses first, then terminal ones
    for status in TaskStatus::ALL {
        let group: Vec<&Task> = tasks.iter().filter(|t| t.status == status).collect();
        if group.is_empty() {
            continue;
        }
        md.push_str(&format!("## {}\n\n", status));
        for task in group {
            md.push_str(&format_task_short(task));
        }
        md.push('\n');
    }

    md
}

/// Format a task in short form for lists.
fn format_task_short(task: &Task) -> String {
    let priority_marker = if task.priority > 0 { "!!! " } else { "" };

    let project = if task.project_name.is_empty() {
        String::new()
    } else {
        format!(" [{}]", task.project_name)
    };

    let queued = task
        .queued_reason
        .as_ref()
        .map(|r| format!(" - _{}_", r))
        .unwrap_or_default();

    format!(
        "- {}#{} {} `{}`{}{}\n",
        priority_marker,
        task.number,
        first_line(&task.description),
        &task.id[..8.min(task.id.len())],
        project,
        queued,
    )
}

/// Render any serializable listing as pretty JSON.
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}
