//! Arena of live tasks keyed by id.

use super::{generate_task_id, TaskHandle};
use crate::types::{Task, TaskStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Owns every task known to the orchestrator.
///
/// Ids are random; the registry re-rolls on the (unlikely) event of a
/// collision so two live tasks never share an id.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskHandle>>,
    next_number: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_number: AtomicU64::new(1),
        }
    }

    /// Register a task, assigning its display number (and a fresh id if the
    /// generated one is taken).
    pub fn insert(&self, mut task: Task) -> TaskHandle {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.contains_key(&task.id) {
            task.id = generate_task_id();
        }
        task.number = self.next_number.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(task);
        tasks.insert(handle.id().to_string(), handle.clone());
        handle
    }

    /// Re-register a task loaded from storage, keeping its id and number.
    pub fn restore(&self, task: Task) -> TaskHandle {
        let number = task.number;
        self.next_number.fetch_max(number + 1, Ordering::Relaxed);
        let handle = TaskHandle::new(task);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id().to_string(), handle.clone());
        handle
    }

    pub fn get(&self, task_id: &str) -> Option<TaskHandle> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task_id)
    }

    pub fn remove(&self, task_id: &str) -> Option<TaskHandle> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.get(task_id).map(|h| h.status())
    }

    /// Whether `task_id` no longer holds anyone up.
    /// Ids that are not (or no longer) registered count as finished.
    pub fn is_finished(&self, task_id: &str) -> bool {
        self.status_of(task_id).is_none_or(|s| s.is_finished())
    }

    /// All handles, ordered by display number.
    pub fn handles(&self) -> Vec<TaskHandle> {
        let mut handles: Vec<TaskHandle> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        handles.sort_by_key(|h| h.read(|t| t.number));
        handles
    }

    /// Copies of every task, ordered by display number.
    pub fn snapshot(&self) -> Vec<Task> {
        self.handles().iter().map(TaskHandle::snapshot).collect()
    }

    pub fn finished(&self) -> Vec<Task> {
        self.snapshot()
            .into_iter()
            .filter(Task::is_finished)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskFlags;
    use std::collections::HashSet;

    #[test]
    fn insert_assigns_sequential_numbers() {
        let registry = TaskRegistry::new();
        let a = registry.insert(Task::create("a", "/p", TaskFlags::default()));
        let b = registry.insert(Task::create("b", "/p", TaskFlags::default()));
        assert_eq!(a.read(|t| t.number), 1);
        assert_eq!(b.read(|t| t.number), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn colliding_id_is_rerolled() {
        let registry = TaskRegistry::new();
        let first = Task::create("a", "/p", TaskFlags::default());
        let mut second = Task::create("b", "/p", TaskFlags::default());
        second.id = first.id.clone();

        let a = registry.insert(first);
        let b = registry.insert(second);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn thousands_of_inserts_stay_unique() {
        let registry = TaskRegistry::new();
        let mut ids = HashSet::new();
        for i in 0..5_000 {
            let handle = registry.insert(Task::create(&i.to_string(), "/p", TaskFlags::default()));
            assert!(ids.insert(handle.id().to_string()));
        }
        assert_eq!(registry.len(), 5_000);
    }

    #[test]
    fn unknown_ids_count_as_finished() {
        let registry = TaskRegistry::new();
        assert!(registry.is_finished("does-not-exist"));

        let task = registry.insert(Task::create("a", "/p", TaskFlags::default()));
        assert!(!registry.is_finished(task.id()));
        task.transition(TaskStatus::Completed);
        assert!(registry.is_finished(task.id()));
    }

    #[test]
    fn restore_keeps_numbering_ahead() {
        let registry = TaskRegistry::new();
        let mut old = Task::create("old", "/p", TaskFlags::default());
        old.number = 41;
        registry.restore(old);
        let fresh = registry.insert(Task::create("new", "/p", TaskFlags::default()));
        assert_eq!(fresh.read(|t| t.number), 42);
    }
}
