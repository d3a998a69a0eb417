//! Task orchestrator.
//!
//! Creates tasks, launches one agent process per running task, watches its
//! streamed output for file writes, and drives the task to a terminal status
//! through retries, iterations and lock queueing.
//!
//! Must be used from within a tokio runtime: launches and timers are spawned
//! tasks.

pub mod classify;
pub mod command;
mod lifecycle;
pub mod process;
pub mod prompt;
pub mod stream;

pub use classify::is_transient_rate_or_token_limit_error;
pub use command::{
    build_invocation_command, build_process_launch_script, build_process_launch_script_for,
    ScriptFlavor,
};
pub use prompt::{
    build_continuation_prompt, build_full_prompt, format_completion_summary, SUMMARY_HEADER,
};

use crate::arbiter::{deps, FileLockArbiter};
use crate::config::Config;
use crate::context::RuntimeTaskContext;
use crate::db::TaskStore;
use crate::error::{ConductorError, ConductorResult};
use crate::task::{generate_task_id, TaskHandle, TaskRegistry};
use crate::types::{FileLock, Task, TaskRequest, TaskStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Which prompt a run starts from. A retry after a rate or token limit
/// reuses the kind of the run that hit it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LaunchKind {
    Initial,
    Continuation,
    /// Relaunch after a lock wait; carries the path that was freed.
    Resume(Option<String>),
    FollowUp(String),
}

pub struct TaskOrchestrator {
    config: Config,
    registry: Arc<TaskRegistry>,
    arbiter: Arc<FileLockArbiter>,
    contexts: Mutex<HashMap<String, Arc<RuntimeTaskContext>>>,
    store: Option<Arc<dyn TaskStore>>,
    /// Default project for requests that name none.
    active_project: Mutex<String>,
    project_descriptions: Mutex<HashMap<String, String>>,
}

impl TaskOrchestrator {
    pub fn new(config: Config, store: Option<Arc<dyn TaskStore>>) -> Arc<Self> {
        let registry = Arc::new(TaskRegistry::new());
        let arbiter = Arc::new(FileLockArbiter::new(Arc::clone(&registry)));
        Arc::new(Self {
            config,
            registry,
            arbiter,
            contexts: Mutex::new(HashMap::new()),
            store,
            active_project: Mutex::new(String::new()),
            project_descriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn arbiter(&self) -> &Arc<FileLockArbiter> {
        &self.arbiter
    }

    pub fn task(&self, task_id: &str) -> ConductorResult<TaskHandle> {
        self.registry
            .get(task_id)
            .ok_or_else(|| ConductorError::task_not_found(task_id))
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.registry.snapshot()
    }

    /// Runtime context of a task, if it has one.
    pub fn context(&self, task_id: &str) -> Option<Arc<RuntimeTaskContext>> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    fn insert_context(&self, task_id: &str) -> Arc<RuntimeTaskContext> {
        let ctx = RuntimeTaskContext::new(task_id);
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string(), Arc::clone(&ctx));
        ctx
    }

    /// Context of a task that has not finished yet.
    fn live_context(&self, task_id: &str) -> ConductorResult<Arc<RuntimeTaskContext>> {
        self.context(task_id)
            .ok_or_else(|| ConductorError::invalid_state(task_id, "Task has finished"))
    }

    fn drop_context(&self, task_id: &str) {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    // Projects

    /// Switch the default project. Existing tasks keep the path they were
    /// created with.
    pub fn set_active_project(&self, project_path: impl Into<String>) {
        let path = project_path.into();
        debug!(project = %path, "active project changed");
        *self
            .active_project
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = path;
    }

    pub fn active_project(&self) -> String {
        self.active_project
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Description injected into prompts of tasks in `project_path`.
    pub fn set_project_description(&self, project_path: &str, description: Option<String>) {
        let mut descriptions = self
            .project_descriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match description {
            Some(text) => descriptions.insert(project_path.to_string(), text),
            None => descriptions.remove(project_path),
        };
    }

    fn project_description(&self, project_path: &str) -> Option<String> {
        self.project_descriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project_path)
            .cloned()
    }

    // Creation

    /// Create a task and start it, or queue it behind unfinished dependencies.
    pub fn create_task(self: &Arc<Self>, request: TaskRequest) -> ConductorResult<TaskHandle> {
        let handle = self.register(request, None, None)?;
        self.start_or_queue(&handle);
        Ok(handle)
    }

    /// Create a group of tasks sharing a group id. With `sequential`, each
    /// task depends on the one before it.
    pub fn create_batch(
        self: &Arc<Self>,
        group_name: &str,
        requests: Vec<TaskRequest>,
        sequential: bool,
    ) -> ConductorResult<Vec<TaskHandle>> {
        let group = (generate_task_id(), group_name.to_string());
        let mut handles: Vec<TaskHandle> = Vec::with_capacity(requests.len());

        for mut request in requests {
            if sequential {
                if let Some(previous) = handles.last() {
                    request.dependency_task_ids.push(previous.id().to_string());
                }
            }
            match self.register(request, Some(group.clone()), None) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // All or nothing: unregister what this batch already added
                    for handle in &handles {
                        self.registry.remove(handle.id());
                        self.drop_context(handle.id());
                    }
                    return Err(err);
                }
            }
        }

        info!(group = %group.1, count = handles.len(), sequential, "batch created");
        for handle in &handles {
            self.start_or_queue(handle);
        }
        Ok(handles)
    }

    /// Create a child of `parent_id`. An empty project path inherits the
    /// parent's.
    pub fn create_subtask(
        self: &Arc<Self>,
        parent_id: &str,
        mut request: TaskRequest,
    ) -> ConductorResult<TaskHandle> {
        let parent = self.task(parent_id)?;
        if request.project_path.is_empty() {
            request.project_path = parent.read(|t| t.project_path.clone());
        }
        let handle = self.register(request, None, Some(parent_id.to_string()))?;
        parent.update(|t| t.child_task_ids.push(handle.id().to_string()));
        self.start_or_queue(&handle);
        Ok(handle)
    }

    fn register(
        &self,
        request: TaskRequest,
        group: Option<(String, String)>,
        parent_id: Option<String>,
    ) -> ConductorResult<TaskHandle> {
        let project_path = if request.project_path.is_empty() {
            self.active_project()
        } else {
            request.project_path.clone()
        };

        let mut task = Task::create(&request.description, &project_path, request.flags);
        deps::validate_declared(&self.registry, &task.id, &request.dependency_task_ids)?;

        task.project_color = request.project_color;
        task.model = request.model.or_else(|| self.config.agent.default_model.clone());
        task.priority = request.priority;
        task.image_paths = request.image_paths;
        task.allow_interrupts = request.allow_interrupts.unwrap_or(true);
        task.git_start_hash = request.git_start_hash;
        task.dependency_task_ids = request.dependency_task_ids;
        task.parent_task_id = parent_id;
        if let Some((group_id, group_name)) = group {
            task.group_id = Some(group_id);
            task.group_name = Some(group_name);
        }
        if task.flags.iterate_until_done {
            task.max_iterations = request
                .max_iterations
                .unwrap_or(self.config.retry.default_max_iterations)
                .max(1);
            task.prepare_for_iterative_start();
        }

        let handle = self.registry.insert(task);
        let ctx = self.insert_context(handle.id());
        for dep in handle.read(|t| t.dependency_task_ids.clone()) {
            ctx.add_dependency(&dep);
        }
        if handle.read(|t| t.flags.plan_only) {
            ctx.set_planning_phase(true);
        }

        info!(
            task_id = handle.id(),
            number = handle.read(|t| t.number),
            project = %project_path,
            "task created"
        );
        Ok(handle)
    }

    fn start_or_queue(self: &Arc<Self>, handle: &TaskHandle) {
        if !self.arbiter.queue_for_dependencies(handle) {
            self.launch(handle, LaunchKind::Initial);
        }
    }

    /// Re-launch a stored task as a new task.
    pub fn launch_stored(self: &Arc<Self>, stored: &Task) -> ConductorResult<TaskHandle> {
        let description = stored
            .stored_prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| stored.description.clone());
        let request = TaskRequest {
            description,
            project_path: stored.project_path.clone(),
            project_color: stored.project_color.clone(),
            model: stored.model.clone(),
            flags: stored.flags,
            priority: stored.priority,
            max_iterations: Some(stored.max_iterations),
            image_paths: stored.image_paths.clone(),
            allow_interrupts: Some(stored.allow_interrupts),
            ..Default::default()
        };
        self.create_task(request)
    }

    // Dependencies

    /// Make `task_id` wait for `dependency_id`. Rejected if it would close a
    /// cycle. A task already running is not stopped.
    pub fn add_dependency(&self, task_id: &str, dependency_id: &str) -> ConductorResult<()> {
        let handle = self.task(task_id)?;
        if !self.registry.contains(dependency_id) {
            return Err(ConductorError::unknown_dependency(task_id, dependency_id));
        }
        if deps::would_create_cycle(&self.registry, task_id, dependency_id) {
            return Err(ConductorError::dependency_cycle(dependency_id, task_id));
        }

        handle.update(|t| {
            if !t.dependency_task_ids.iter().any(|d| d == dependency_id) {
                t.dependency_task_ids.push(dependency_id.to_string());
            }
        });
        if let Some(ctx) = self.context(task_id) {
            ctx.add_dependency(dependency_id);
        }
        debug!(task_id, dependency_id, "dependency added");
        Ok(())
    }

    // Control

    /// Cancel a task: kill its process tree, release its locks and wake
    /// waiters. Returns `false` if the task had already finished.
    pub fn cancel(self: &Arc<Self>, task_id: &str) -> ConductorResult<bool> {
        let handle = self.task(task_id)?;
        if handle.is_finished() {
            return Ok(false);
        }
        self.arbiter.dequeue(task_id);
        Ok(self.finalize(&handle, TaskStatus::Cancelled, Some("Cancelled by user".to_string())))
    }

    /// Suspend a running task. Returns `false` if it had already finished.
    pub fn pause(&self, task_id: &str) -> ConductorResult<bool> {
        let handle = self.task(task_id)?;
        match handle.status() {
            status if status.is_finished() => return Ok(false),
            TaskStatus::Running => {}
            status => {
                return Err(ConductorError::invalid_state(
                    task_id,
                    &format!("Cannot pause a {} task", status),
                ));
            }
        }

        let ctx = self.live_context(task_id)?;
        if let Some(pid) = ctx.process_id() {
            if !process::suspend_process_tree(pid) {
                return Err(ConductorError::invalid_state(
                    task_id,
                    "Pausing a live process is not supported on this platform",
                ));
            }
        } else {
            // Between runs: hold back the pending iteration or retry
            ctx.disarm_timer();
        }
        handle.transition(TaskStatus::Paused);
        info!(task_id, "task paused");
        Ok(true)
    }

    /// Continue a paused task. Returns `false` if it had already finished.
    pub fn resume(self: &Arc<Self>, task_id: &str) -> ConductorResult<bool> {
        let handle = self.task(task_id)?;
        match handle.status() {
            status if status.is_finished() => return Ok(false),
            TaskStatus::Paused => {}
            status => {
                return Err(ConductorError::invalid_state(
                    task_id,
                    &format!("Cannot resume a {} task", status),
                ));
            }
        }

        let ctx = self.live_context(task_id)?;
        handle.transition(TaskStatus::Running);
        match ctx.process_id() {
            Some(pid) => {
                process::resume_process_tree(pid);
            }
            None => {
                let kind = if handle.read(|t| t.flags.iterate_until_done && t.current_iteration > 1) {
                    LaunchKind::Continuation
                } else {
                    LaunchKind::Initial
                };
                self.launch(&handle, kind);
            }
        }
        info!(task_id, "task resumed");
        Ok(true)
    }

    /// Queue a message for delivery when the agent next accepts input.
    pub fn send_message(&self, task_id: &str, text: &str) -> ConductorResult<()> {
        let handle = self.task(task_id)?;
        if handle.is_finished() {
            return Err(ConductorError::invalid_state(task_id, "Task has finished"));
        }
        self.live_context(task_id)?.push_message(text);
        debug!(task_id, "message queued");
        Ok(())
    }

    /// Queue a high-priority message. Delivered ahead of ordinary messages,
    /// and only if the task allows interrupts.
    pub fn send_interrupt(&self, task_id: &str, text: &str) -> ConductorResult<()> {
        let handle = self.task(task_id)?;
        if handle.is_finished() {
            return Err(ConductorError::invalid_state(task_id, "Task has finished"));
        }
        if !handle.read(|t| t.allow_interrupts) {
            debug!(task_id, "interrupt queued on a task that does not accept interrupts");
        }
        self.live_context(task_id)?.push_interrupt(text);
        Ok(())
    }

    // Locks

    pub fn locks(&self) -> Vec<FileLock> {
        self.arbiter.locks()
    }

    /// Toggle a lock's ignored flag; waiters it unblocks are relaunched.
    pub fn set_lock_ignored(self: &Arc<Self>, normalized_path: &str, ignored: bool) -> ConductorResult<()> {
        let waiting = self.waiting_paths();
        let promoted = self.arbiter.set_lock_ignored(normalized_path, ignored)?;
        self.relaunch_promoted(promoted, &waiting);
        Ok(())
    }

    // Waiting and housekeeping

    /// Resolve once the task reaches a terminal status.
    pub async fn wait_for_terminal(&self, task_id: &str) -> ConductorResult<Task> {
        let handle = self.task(task_id)?;
        let notify = Arc::new(Notify::new());
        let waker = Arc::clone(&notify);
        let subscription = handle.subscribe_field("is_finished", move |_| waker.notify_one());

        while !handle.is_finished() {
            notify.notified().await;
        }

        handle.unsubscribe(subscription);
        Ok(handle.snapshot())
    }

    /// Drop finished tasks from the registry. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let finished = self.registry.finished();
        for task in &finished {
            self.registry.remove(&task.id);
            self.drop_context(&task.id);
        }
        finished.len()
    }

    // Persistence

    /// Save every finished task to the history store.
    pub async fn save_history(&self) -> ConductorResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save_history(self.registry.finished()).await
    }

    /// Load retained history into the registry. Ids already present are
    /// left untouched. Returns the number of tasks restored.
    pub async fn restore_history(&self) -> ConductorResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let tasks = store.load_history(self.config.store.retention_hours).await?;
        let mut restored = 0;
        for task in tasks {
            if !self.registry.contains(&task.id) {
                self.registry.restore(task);
                restored += 1;
            }
        }
        Ok(restored)
    }

    pub async fn save_stored_tasks(&self, tasks: Vec<Task>) -> ConductorResult<()> {
        match &self.store {
            Some(store) => store.save_stored_tasks(tasks).await,
            None => Err(ConductorError::persistence("No task store configured")),
        }
    }

    pub async fn load_stored_tasks(&self) -> ConductorResult<Vec<Task>> {
        match &self.store {
            Some(store) => store.load_stored_tasks().await,
            None => Ok(Vec::new()),
        }
    }
}
