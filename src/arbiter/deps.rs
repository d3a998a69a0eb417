//! Dependency validation and cycle detection.

use crate::error::{ConductorError, ConductorResult};
use crate::task::TaskRegistry;
use std::collections::{HashMap, HashSet, VecDeque};

/// Every declared dependency must already be registered.
///
/// Declaring only previously-registered tasks keeps the explicit dependency
/// graph acyclic by construction.
pub fn validate_declared(
    registry: &TaskRegistry,
    task_id: &str,
    dependency_ids: &[String],
) -> ConductorResult<()> {
    for dep in dependency_ids {
        if dep == task_id || !registry.contains(dep) {
            return Err(ConductorError::unknown_dependency(task_id, dep));
        }
    }
    Ok(())
}

/// Dependencies that have not reached a terminal status yet.
pub fn unfinished(registry: &TaskRegistry, dependency_ids: &[String]) -> Vec<String> {
    dependency_ids
        .iter()
        .filter(|id| !registry.is_finished(id))
        .cloned()
        .collect()
}

/// Check if making `task_id` depend on `dependency_id` would create a cycle,
/// i.e. whether `dependency_id` can already reach `task_id`.
pub fn would_create_cycle(registry: &TaskRegistry, task_id: &str, dependency_id: &str) -> bool {
    if task_id == dependency_id {
        return true;
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(dependency_id.to_string());

    while let Some(current) = queue.pop_front() {
        if current == task_id {
            return true;
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(handle) = registry.get(&current) {
            for dep in handle.read(|t| t.dependency_task_ids.clone()) {
                if !visited.contains(&dep) {
                    queue.push_back(dep);
                }
            }
        }
    }

    false
}

/// Check if `waiter` waiting on `holder` closes a loop in the wait-for graph
/// (`holder` already waits, directly or transitively, on `waiter`).
pub fn would_deadlock(
    wait_for: &HashMap<String, Vec<String>>,
    waiter: &str,
    holder: &str,
) -> bool {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(holder);

    while let Some(current) = queue.pop_front() {
        if current == waiter {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(blockers) = wait_for.get(current) {
            queue.extend(blockers.iter().map(String::as_str));
        }
    }

    false
}
