//! Prompt assembly and completion summaries.

use crate::types::{Task, TaskStatus};
use std::time::Duration;

/// First line of every completion summary.
pub const SUMMARY_HEADER: &str = "=== TASK SUMMARY ===";

const NO_GIT_WRITE_BLOCK: &str = "CONSTRAINTS:\n\
Do not run git write operations (commit, push, merge, rebase, reset, stash, \
branch or tag changes). Leave all changes uncommitted in the working tree.";

const EXTENDED_PLANNING_BLOCK: &str = "PLANNING:\n\
Before editing anything, study the relevant code and write out a step-by-step \
plan. Then carry out the plan, revising it if you learn something new.";

const AUTO_DECOMPOSE_BLOCK: &str = "DECOMPOSITION:\n\
If the task is large, split it into independent subtasks and finish them one \
at a time, verifying each before moving on.";

const PLAN_ONLY_BLOCK: &str = "PLAN ONLY:\n\
Produce a plan for the task below. Do not modify any files.";

/// Assemble the full prompt for a first run.
///
/// Sections, in order: system prompt, project description, constraint and
/// workflow blocks selected by the task's flags, then the task itself.
/// Absent or blank sections are left out entirely.
pub fn build_full_prompt(
    system_prompt: &str,
    task: &Task,
    project_description: Option<&str>,
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !system_prompt.trim().is_empty() {
        sections.push(system_prompt.trim().to_string());
    }

    if let Some(description) = project_description.map(str::trim).filter(|d| !d.is_empty()) {
        sections.push(format!("PROJECT:\n{}", description));
    }

    if task.flags.no_git_write {
        sections.push(NO_GIT_WRITE_BLOCK.to_string());
    }
    if task.flags.extended_planning {
        sections.push(EXTENDED_PLANNING_BLOCK.to_string());
    }
    if task.flags.auto_decompose {
        sections.push(AUTO_DECOMPOSE_BLOCK.to_string());
    }
    if task.flags.plan_only {
        sections.push(PLAN_ONLY_BLOCK.to_string());
    }

    if !task.image_paths.is_empty() {
        let list: Vec<String> = task.image_paths.iter().map(|p| format!("- {}", p)).collect();
        sections.push(format!("ATTACHED IMAGES:\n{}", list.join("\n")));
    }

    sections.push(format!("TASK:\n{}", task.description.trim()));
    sections.join("\n\n")
}

/// Prompt delivering a queued user message as a follow-up run.
pub fn build_followup_prompt(description: &str, message: &str) -> String {
    format!(
        "You previously worked on this task:\n{}\n\nThe user sent a follow-up:\n{}",
        description.trim(),
        message.trim()
    )
}

/// Instructions appended to the system prompt in run-until-done mode.
pub fn build_iteration_instructions(completion_marker: &str, max_iterations: u32) -> String {
    format!(
        "You are running in an iterative loop of up to {} iterations. \
         When the task is completely finished and verified, print {} on a line by itself.",
        max_iterations, completion_marker
    )
}

/// Prompt for every iteration after the first.
pub fn build_continuation_prompt(iteration: u32, max_iterations: u32) -> String {
    format!(
        "Continue working on the task. This is iteration {}/{}. \
         Review what has been done so far, finish the remaining work, and print \
         the completion marker once everything is done.",
        iteration, max_iterations
    )
}

/// Prompt for a task relaunched after the file it waited on was freed.
pub fn build_resume_prompt(description: &str, freed_path: Option<&str>) -> String {
    let freed = match freed_path {
        Some(path) => format!("The file {} is now available to you. ", path),
        None => String::new(),
    };
    format!(
        "{}You were paused while another task held a file you needed. \
         Resume the task where you left off.\n\nTASK:\n{}",
        freed,
        description.trim()
    )
}

/// Human-readable closing block for a finished task.
pub fn format_completion_summary(status: TaskStatus, duration: Duration, extra: Option<&str>) -> String {
    let minutes = duration.as_secs_f64() / 60.0;
    let mut summary = format!(
        "{}\nStatus: {}\nDuration: {:.1} minutes",
        SUMMARY_HEADER, status, minutes
    );
    if let Some(extra) = extra.map(str::trim).filter(|e| !e.is_empty()) {
        summary.push('\n');
        summary.push_str(extra);
    }
    summary
}
