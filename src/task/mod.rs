//! Task entity, observable handle and registry.

mod registry;
mod state;

pub use registry::TaskRegistry;
pub use state::{generate_task_id, project_name_of};

use crate::subscriptions::{diff_fields, ChangeEvent, ChangeNotifier, SubscriptionId};
use crate::types::{Task, TaskStatus};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};

struct TaskShared {
    id: String,
    task: RwLock<Task>,
    notifier: ChangeNotifier,
}

/// Shared, observable reference to a task.
///
/// Every mutation made through [`TaskHandle::update`] is diffed field by field
/// and published to subscribers once the write lock has been released. The
/// derived predicates (`is_finished`, `is_running`, `is_queued`, `is_paused`)
/// are published as fields of their own.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn new(task: Task) -> Self {
        Self {
            inner: Arc::new(TaskShared {
                id: task.id.clone(),
                task: RwLock::new(task),
                notifier: ChangeNotifier::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Copy of the current task state.
    pub fn snapshot(&self) -> Task {
        self.read(Task::clone)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Task) -> R) -> R {
        let task = self
            .inner
            .task
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&task)
    }

    pub fn status(&self) -> TaskStatus {
        self.read(|t| t.status)
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Mutate the task and publish a change event per modified field.
    pub fn update<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let (result, events) = {
            let mut task = self
                .inner
                .task
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let before = observable(&task);
            let result = f(&mut task);
            let after = observable(&task);
            (result, diff_fields(&self.inner.id, &before, &after))
        };
        self.inner.notifier.publish(&events);
        result
    }

    /// Status transition honouring the terminal-sink rule.
    pub fn transition(&self, status: TaskStatus) -> bool {
        self.update(|t| t.transition(status))
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(callback)
    }

    pub fn subscribe_field<F>(&self, field: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe_field(field, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

/// JSON view of a task including its derived predicates.
fn observable(task: &Task) -> Value {
    let mut value = serde_json::to_value(task).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        map.insert("is_finished".into(), Value::Bool(task.is_finished()));
        map.insert("is_running".into(), Value::Bool(task.is_running()));
        map.insert("is_queued".into(), Value::Bool(task.is_queued()));
        map.insert("is_paused".into(), Value::Bool(task.is_paused()));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskFlags;
    use std::sync::Mutex;

    fn handle() -> TaskHandle {
        TaskHandle::new(Task::create("t", "/p", TaskFlags::default()))
    }

    #[test]
    fn status_change_publishes_status_and_predicates() {
        let task = handle();
        let fields = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fields);
        task.subscribe(move |e| sink.lock().unwrap().push(e.field.clone()));

        assert!(task.transition(TaskStatus::Queued));

        let fields = fields.lock().unwrap();
        assert!(fields.contains(&"status".to_string()));
        assert!(fields.contains(&"is_running".to_string()));
        assert!(fields.contains(&"is_queued".to_string()));
        assert!(!fields.contains(&"is_finished".to_string()));
    }

    #[test]
    fn unchanged_fields_are_not_published() {
        let task = handle();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        task.subscribe(move |_| *sink.lock().unwrap() += 1);

        task.update(|t| t.summary = None);
        assert_eq!(*count.lock().unwrap(), 0);

        task.update(|t| t.summary = Some("done".into()));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn callback_may_read_the_task() {
        let task = handle();
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let reader = task.clone();
        task.subscribe_field("status", move |_| {
            *sink.lock().unwrap() = Some(reader.status());
        });

        task.transition(TaskStatus::Failed);
        assert_eq!(*observed.lock().unwrap(), Some(TaskStatus::Failed));
    }

    #[test]
    fn recancel_publishes_nothing() {
        let task = handle();
        task.transition(TaskStatus::Cancelled);
        let end = task.read(|t| t.end_time);

        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        task.subscribe(move |_| *sink.lock().unwrap() += 1);

        assert!(!task.transition(TaskStatus::Cancelled));
        assert_eq!(*count.lock().unwrap(), 0);
        assert_eq!(task.read(|t| t.end_time), end);
    }
}
