//! File lock arbiter.
//!
//! Owns the lock table (normalized path -> [`FileLock`]) and the queued-task
//! table (task id -> [`QueuedTaskInfo`]). Each table sits behind its own mutex
//! and the two are never held at the same time; task handles are only
//! touched after both have been released, so change callbacks may call back
//! into the arbiter.
//!
//! Flow for a task that hits a conflict:
//! Running --(conflict)--> Queued --(blockers done + re-acquire ok)--> Running
//! Queued --(re-acquire hits a new owner)--> Queued (blocker updated)

pub mod deps;
pub mod fragment;

pub use fragment::{extract_string_field, try_extract_file_path_from_partial, FieldValue};

use crate::db::now_ms;
use crate::error::{ConductorError, ConductorResult};
use crate::paths::normalize_path;
use crate::subscriptions::{diff_fields, ChangeEvent, ChangeNotifier, SubscriptionId};
use crate::task::{TaskHandle, TaskRegistry};
use crate::types::{FileLock, QueuedTaskInfo, TaskStatus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Result of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Conflict { owner_task_id: String },
}

/// State of a path's slot in the lock table, as seen by one requester.
enum Slot {
    Free,
    Own,
    Held(String),
    Stale,
}

/// What a release did.
#[derive(Debug, Clone, Default)]
pub struct ReleaseReport {
    pub released: Vec<FileLock>,
    /// Tasks moved from Queued back to Running, in promotion order.
    pub promoted: Vec<String>,
}

/// Registry of file ownership and of tasks waiting on it.
pub struct FileLockArbiter {
    registry: Arc<TaskRegistry>,
    locks: Mutex<HashMap<String, FileLock>>,
    queued: Mutex<HashMap<String, QueuedTaskInfo>>,
    queue_sequence: AtomicU64,
    notifier: ChangeNotifier,
}

impl FileLockArbiter {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            locks: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            queue_sequence: AtomicU64::new(0),
            notifier: ChangeNotifier::new(),
        }
    }

    /// See [`crate::paths::normalize_path`].
    pub fn normalize_path(&self, raw_path: &str, project_path: &str) -> String {
        normalize_path(raw_path, project_path)
    }

    /// Claim `raw_path` for `task_id`.
    ///
    /// Tasks with `ignore_file_locks` always succeed; the lock they leave
    /// behind is marked ignored and never blocks anyone.
    pub fn try_acquire(
        &self,
        task_id: &str,
        raw_path: &str,
        project_path: &str,
        tool_name: &str,
    ) -> LockOutcome {
        let normalized = normalize_path(raw_path, project_path);
        self.acquire_normalized(task_id, &normalized, raw_path, tool_name)
    }

    fn acquire_normalized(
        &self,
        task_id: &str,
        normalized: &str,
        original: &str,
        tool_name: &str,
    ) -> LockOutcome {
        let ignoring = self
            .registry
            .get(task_id)
            .is_some_and(|h| h.read(|t| t.flags.ignore_file_locks));

        let (outcome, events) = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            let before = locks.get(normalized).map(lock_value);

            let slot = match locks.get(normalized) {
                None => Slot::Free,
                Some(existing) if existing.owner_task_id == task_id => Slot::Own,
                Some(existing)
                    if !existing.ignored
                        && !self.registry.is_finished(&existing.owner_task_id) =>
                {
                    Slot::Held(existing.owner_task_id.clone())
                }
                // Ignored, or left behind by a finished owner
                Some(_) => Slot::Stale,
            };

            let outcome = match slot {
                Slot::Own => {
                    if let Some(lock) = locks.get_mut(normalized) {
                        lock.tool_name = tool_name.to_string();
                        if !ignoring {
                            lock.ignored = false;
                        }
                    }
                    LockOutcome::Acquired
                }
                Slot::Held(_) if ignoring => LockOutcome::Acquired,
                Slot::Held(owner_task_id) => LockOutcome::Conflict { owner_task_id },
                Slot::Free | Slot::Stale => {
                    locks.insert(
                        normalized.to_string(),
                        FileLock {
                            normalized_path: normalized.to_string(),
                            original_path: original.to_string(),
                            owner_task_id: task_id.to_string(),
                            tool_name: tool_name.to_string(),
                            ignored: ignoring,
                            locked_at: now_ms(),
                        },
                    );
                    LockOutcome::Acquired
                }
            };

            let after = locks.get(normalized).map(lock_value);
            (outcome, lock_events(normalized, before, after))
        };

        self.notifier.publish(&events);
        match &outcome {
            LockOutcome::Acquired => {
                debug!(task_id, path = normalized, tool = tool_name, "lock acquired")
            }
            LockOutcome::Conflict { owner_task_id } => {
                info!(task_id, path = normalized, owner = %owner_task_id, "lock conflict")
            }
        }
        outcome
    }

    /// Try to lock; on conflict park the task in the queue.
    ///
    /// Queuing stamps `queued_reason` and the blocker id on the task and moves
    /// it to Queued. If queuing would make the holder and the requester wait
    /// on each other, the requester yields its own locks first so the holder
    /// can always finish.
    pub fn acquire_or_queue(
        &self,
        task_id: &str,
        raw_path: &str,
        project_path: &str,
        tool_name: &str,
    ) -> LockOutcome {
        let normalized = normalize_path(raw_path, project_path);
        let outcome = self.acquire_normalized(task_id, &normalized, raw_path, tool_name);
        if let LockOutcome::Conflict { owner_task_id } = &outcome {
            self.queue_on_conflict(task_id, &normalized, raw_path, tool_name, owner_task_id);
        }
        outcome
    }

    fn queue_on_conflict(
        &self,
        task_id: &str,
        normalized: &str,
        original: &str,
        tool_name: &str,
        owner: &str,
    ) {
        let Some(handle) = self.registry.get(task_id) else {
            return;
        };

        if deps::would_deadlock(&self.wait_for_graph(), task_id, owner) {
            warn!(task_id, owner, "lock wait would deadlock; requester yields its locks");
            self.drop_locks(task_id);
        }

        let owner_number = self
            .registry
            .get(owner)
            .map(|h| h.read(|t| t.number))
            .unwrap_or_default();
        let reason = format!(
            "Waiting for {} (locked by task #{})",
            original, owner_number
        );

        let (explicit, priority) =
            handle.read(|t| (t.dependency_task_ids.clone(), t.priority));
        let mut blocking = deps::unfinished(&self.registry, &explicit);
        if !blocking.iter().any(|id| id == owner) {
            blocking.push(owner.to_string());
        }

        let info = QueuedTaskInfo {
            task_id: task_id.to_string(),
            conflicting_path: Some(normalized.to_string()),
            original_path: Some(original.to_string()),
            tool_name: Some(tool_name.to_string()),
            primary_blocker_id: Some(owner.to_string()),
            blocking_task_ids: blocking,
            priority,
            sequence: self.queue_sequence.fetch_add(1, Ordering::Relaxed),
            queued_at: now_ms(),
        };
        self.register_queued(info);

        handle.update(|t| {
            t.transition(TaskStatus::Queued);
            t.queued_reason = Some(reason.clone());
            t.blocked_by_task_id = Some(owner.to_string());
        });
        info!(task_id, owner, reason = %reason, "task queued on file lock");
    }

    /// Park a task whose declared dependencies have not all finished.
    /// Returns `false` (and leaves the task alone) when nothing blocks it.
    pub fn queue_for_dependencies(&self, handle: &TaskHandle) -> bool {
        let (explicit, priority) =
            handle.read(|t| (t.dependency_task_ids.clone(), t.priority));
        let blocking = deps::unfinished(&self.registry, &explicit);
        if blocking.is_empty() {
            return false;
        }

        let reason = if blocking.len() == 1 {
            "Waiting for 1 dependency".to_string()
        } else {
            format!("Waiting for {} dependencies", blocking.len())
        };
        let err = ConductorError::deps_not_satisfied(handle.id(), &blocking);

        self.register_queued(QueuedTaskInfo {
            task_id: handle.id().to_string(),
            conflicting_path: None,
            original_path: None,
            tool_name: None,
            primary_blocker_id: blocking.first().cloned(),
            blocking_task_ids: blocking,
            priority,
            sequence: self.queue_sequence.fetch_add(1, Ordering::Relaxed),
            queued_at: now_ms(),
        });

        handle.update(|t| {
            t.transition(TaskStatus::Queued);
            t.queued_reason = Some(reason);
        });
        info!(task_id = handle.id(), code = ?err.code, error = %err, "task queued on dependencies");
        true
    }

    fn register_queued(&self, info: QueuedTaskInfo) {
        let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
        match queued.get_mut(&info.task_id) {
            Some(existing) => {
                // Already waiting: widen the blocker set, keep queue position
                for id in info.blocking_task_ids {
                    if !existing.blocking_task_ids.contains(&id) {
                        existing.blocking_task_ids.push(id);
                    }
                }
                if info.conflicting_path.is_some() {
                    existing.conflicting_path = info.conflicting_path;
                    existing.original_path = info.original_path;
                    existing.tool_name = info.tool_name;
                }
                if info.primary_blocker_id.is_some() {
                    existing.primary_blocker_id = info.primary_blocker_id;
                }
            }
            None => {
                queued.insert(info.task_id.clone(), info);
            }
        }
    }

    /// Release every lock owned by `task_id`, then re-evaluate the queue.
    pub fn release(&self, task_id: &str) -> ReleaseReport {
        let released = self.drop_locks(task_id);
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);

        if !released.is_empty() {
            info!(task_id, count = released.len(), "released file locks");
        }
        let promoted = self.check_queued_tasks();
        ReleaseReport { released, promoted }
    }

    fn drop_locks(&self, task_id: &str) -> Vec<FileLock> {
        let released: Vec<FileLock> = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            let paths: Vec<String> = locks
                .values()
                .filter(|l| l.owner_task_id == task_id)
                .map(|l| l.normalized_path.clone())
                .collect();
            paths.iter().filter_map(|p| locks.remove(p)).collect()
        };

        let events: Vec<ChangeEvent> = released
            .iter()
            .flat_map(|l| lock_events(&l.normalized_path, Some(lock_value(l)), None))
            .collect();
        self.notifier.publish(&events);
        released
    }

    /// Promote every queued task whose blockers are satisfied and whose
    /// conflicting path can be re-acquired. Candidates are visited in
    /// descending priority, ties broken by queue insertion order.
    pub fn check_queued_tasks(&self) -> Vec<String> {
        let mut candidates: Vec<QueuedTaskInfo> = {
            let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
            // Tasks finished while waiting (e.g. cancelled) leave the queue
            queued.retain(|id, _| !self.registry.is_finished(id));
            queued.values().cloned().collect()
        };
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));

        let mut promoted = Vec::new();
        for info in candidates {
            let Some(handle) = self.registry.get(&info.task_id) else {
                continue;
            };
            if !handle.status().is_queued() || !self.blockers_satisfied(&handle, &info) {
                continue;
            }

            if let (Some(path), Some(original)) = (&info.conflicting_path, &info.original_path) {
                let tool = info.tool_name.as_deref().unwrap_or_default();
                if let LockOutcome::Conflict { owner_task_id } =
                    self.acquire_normalized(&info.task_id, path, original, tool)
                {
                    self.reassign_blocker(&handle, &info, &owner_task_id);
                    continue;
                }
            }

            self.queued
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&info.task_id);
            let resumed = handle.update(|t| {
                if !t.transition(TaskStatus::Running) {
                    return false;
                }
                t.queued_reason = None;
                t.blocked_by_task_id = None;
                t.start_time = now_ms();
                true
            });
            if resumed {
                info!(task_id = %info.task_id, "queued task promoted");
                promoted.push(info.task_id);
            }
        }
        promoted
    }

    /// All explicit dependencies finished, and every lock blocker either
    /// finished or no longer holding the contested path.
    fn blockers_satisfied(&self, handle: &TaskHandle, info: &QueuedTaskInfo) -> bool {
        let explicit = handle.read(|t| t.dependency_task_ids.clone());
        if !deps::unfinished(&self.registry, &explicit).is_empty() {
            return false;
        }
        info.blocking_task_ids.iter().all(|blocker| {
            if self.registry.is_finished(blocker) {
                return true;
            }
            if explicit.contains(blocker) {
                return false;
            }
            match &info.conflicting_path {
                Some(path) => !self.holds_active(blocker, path),
                None => false,
            }
        })
    }

    fn holds_active(&self, task_id: &str, normalized: &str) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(normalized)
            .is_some_and(|l| l.owner_task_id == task_id && !l.ignored)
    }

    fn reassign_blocker(&self, handle: &TaskHandle, info: &QueuedTaskInfo, owner: &str) {
        {
            let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = queued.get_mut(&info.task_id) {
                entry.primary_blocker_id = Some(owner.to_string());
                if !entry.blocking_task_ids.iter().any(|id| id == owner) {
                    entry.blocking_task_ids.push(owner.to_string());
                }
            }
        }
        let owner_number = self
            .registry
            .get(owner)
            .map(|h| h.read(|t| t.number))
            .unwrap_or_default();
        let original = info.original_path.clone().unwrap_or_default();
        handle.update(|t| {
            t.blocked_by_task_id = Some(owner.to_string());
            t.queued_reason = Some(format!(
                "Waiting for {} (locked by task #{})",
                original, owner_number
            ));
        });
        debug!(task_id = %info.task_id, owner, "queued task blocker reassigned");
    }

    /// Remove a task from the queue without promoting it.
    pub fn dequeue(&self, task_id: &str) -> Option<QueuedTaskInfo> {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)
    }

    /// Mark a lock ignored (it stays visible but stops blocking) or active.
    /// Ignoring a lock may unblock waiters; their ids are returned.
    pub fn set_lock_ignored(&self, normalized_path: &str, ignored: bool) -> ConductorResult<Vec<String>> {
        let events = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            let lock = locks.get_mut(normalized_path).ok_or_else(|| {
                ConductorError::invalid_state(normalized_path, "No lock on this path")
            })?;
            let before = lock_value(lock);
            lock.ignored = ignored;
            lock_events(normalized_path, Some(before), Some(lock_value(lock)))
        };
        self.notifier.publish(&events);

        Ok(if ignored {
            self.check_queued_tasks()
        } else {
            Vec::new()
        })
    }

    /// Snapshot of the lock table, ordered by path.
    pub fn locks(&self) -> Vec<FileLock> {
        let mut locks: Vec<FileLock> = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.normalized_path.cmp(&b.normalized_path));
        locks
    }

    pub fn locks_of(&self, task_id: &str) -> Vec<FileLock> {
        self.locks()
            .into_iter()
            .filter(|l| l.owner_task_id == task_id)
            .collect()
    }

    /// Current (non-ignored) owner of a path.
    pub fn owner_of(&self, raw_path: &str, project_path: &str) -> Option<String> {
        let normalized = normalize_path(raw_path, project_path);
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalized)
            .filter(|l| !l.ignored)
            .map(|l| l.owner_task_id.clone())
    }

    /// Snapshot of the queue in promotion order.
    pub fn queued(&self) -> Vec<QueuedTaskInfo> {
        let mut entries: Vec<QueuedTaskInfo> = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));
        entries
    }

    pub fn queued_info(&self, task_id: &str) -> Option<QueuedTaskInfo> {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    fn wait_for_graph(&self) -> HashMap<String, Vec<String>> {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|q| (q.task_id.clone(), q.blocking_task_ids.clone()))
            .collect()
    }

    /// Observe lock changes (source = normalized path; fields `owner_task_id`,
    /// `tool_name`, `ignored`, `status`).
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }
}

fn lock_value(lock: &FileLock) -> Value {
    json!({
        "owner_task_id": lock.owner_task_id,
        "original_path": lock.original_path,
        "tool_name": lock.tool_name,
        "ignored": lock.ignored,
        "status": lock.status_text(),
    })
}

fn lock_events(path: &str, before: Option<Value>, after: Option<Value>) -> Vec<ChangeEvent> {
    let empty = json!({});
    diff_fields(
        path,
        before.as_ref().unwrap_or(&empty),
        after.as_ref().unwrap_or(&empty),
    )
}
