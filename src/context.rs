//! Per-task runtime scratch state.
//!
//! Never persisted. Every collection sits behind its own mutex and is handed
//! out as a copy, so the coordinating flow, the output reader and the exit
//! watcher can touch different parts without serializing on one lock.

use crate::orchestrator::process::kill_process_tree;
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// The two delayed re-invocations a task can have pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Next run-until-done iteration.
    Iteration,
    /// Re-run after a transient rate/token limit failure.
    Retry,
}

struct ArmedTimer {
    kind: TimerKind,
    id: u64,
    handle: JoinHandle<()>,
}

/// A tool call being streamed by the agent.
#[derive(Debug, Clone, Default)]
pub struct PendingToolCall {
    pub block_index: Option<u64>,
    pub tool_name: Option<String>,
    pub partial_input: String,
    /// Set once a lock has been attempted for this call.
    pub lock_attempted: bool,
}

pub struct RuntimeTaskContext {
    task_id: String,

    pid: Mutex<Option<u32>>,
    cancelled: AtomicBool,
    cancel_signal: Notify,
    finalizing: AtomicBool,
    disposed: AtomicBool,
    /// Bumped whenever the current process is abandoned, so late exit
    /// notifications from it can be recognised and dropped.
    run_generation: AtomicU64,

    output: Mutex<String>,
    consecutive_token_limit_retries: AtomicU32,

    dependency_ids: Mutex<BTreeSet<String>>,
    locked_files: Mutex<BTreeSet<String>>,
    pending_messages: Mutex<VecDeque<String>>,
    interrupt_messages: Mutex<VecDeque<String>>,

    planning_phase: AtomicBool,

    tool_call: Mutex<Option<PendingToolCall>>,

    timer: Mutex<Option<ArmedTimer>>,
    timer_ids: AtomicU64,
}

impl RuntimeTaskContext {
    pub fn new(task_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            task_id: task_id.into(),
            pid: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            cancel_signal: Notify::new(),
            finalizing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            run_generation: AtomicU64::new(0),
            output: Mutex::new(String::new()),
            consecutive_token_limit_retries: AtomicU32::new(0),
            dependency_ids: Mutex::new(BTreeSet::new()),
            locked_files: Mutex::new(BTreeSet::new()),
            pending_messages: Mutex::new(VecDeque::new()),
            interrupt_messages: Mutex::new(VecDeque::new()),
            planning_phase: AtomicBool::new(false),
            tool_call: Mutex::new(None),
            timer: Mutex::new(None),
            timer_ids: AtomicU64::new(0),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    // Process

    pub fn set_process(&self, pid: u32) {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = Some(pid);
    }

    pub fn process_id(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the process handle if it still refers to `pid`.
    pub fn clear_process(&self, pid: u32) {
        let mut slot = self.pid.lock().unwrap_or_else(PoisonError::into_inner);
        if *slot == Some(pid) {
            *slot = None;
        }
    }

    /// Abandon the current run: later exit notifications for it are stale,
    /// and its process tree is killed.
    pub fn stop_process(&self) {
        self.run_generation.fetch_add(1, Ordering::SeqCst);
        let pid = self.pid.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pid) = pid {
            kill_process_tree(pid);
        }
    }

    pub fn generation(&self) -> u64 {
        self.run_generation.load(Ordering::SeqCst)
    }

    /// Start a new run and return its generation.
    pub fn next_generation(&self) -> u64 {
        self.run_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    // Cancellation and finalisation

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_signal.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.cancel_signal.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Claim the right to finalise the task. Only the first caller gets `true`.
    pub fn begin_finalize(&self) -> bool {
        !self.finalizing.swap(true, Ordering::SeqCst)
    }

    /// Tear down timers, the process tree and outstanding waiters.
    /// Idempotent; later calls do nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel();
        self.disarm_timer();
        self.stop_process();
        debug!(task_id = %self.task_id, "runtime context disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // Output

    pub fn append_output(&self, text: &str) {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output.push_str(text);
        if !text.ends_with('\n') {
            output.push('\n');
        }
    }

    pub fn output(&self) -> String {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn output_len(&self) -> usize {
        self.output.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Output from byte offset `start` onward (empty if out of range).
    pub fn output_since(&self, start: usize) -> String {
        let output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output.get(start..).unwrap_or_default().to_string()
    }

    // Retry counter

    pub fn record_token_limit_retry(&self) -> u32 {
        self.consecutive_token_limit_retries
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    pub fn reset_token_limit_retries(&self) {
        self.consecutive_token_limit_retries
            .store(0, Ordering::SeqCst);
    }

    // Sets and queues

    pub fn add_dependency(&self, task_id: &str) {
        self.dependency_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string());
    }

    pub fn dependency_ids(&self) -> Vec<String> {
        self.dependency_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Record a file this task wrote, for the eventual commit.
    pub fn add_locked_file(&self, path: &str) -> bool {
        self.locked_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string())
    }

    pub fn locked_files(&self) -> Vec<String> {
        self.locked_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn push_message(&self, text: impl Into<String>) {
        self.pending_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(text.into());
    }

    pub fn push_interrupt(&self, text: impl Into<String>) {
        self.interrupt_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(text.into());
    }

    pub fn pending_messages(&self) -> Vec<String> {
        self.pending_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn interrupt_messages(&self) -> Vec<String> {
        self.interrupt_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Dequeue the next input: interrupts first (when allowed), then
    /// ordinary messages.
    pub fn next_input(&self, allow_interrupts: bool) -> Option<String> {
        if allow_interrupts {
            let interrupt = self
                .interrupt_messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if interrupt.is_some() {
                return interrupt;
            }
        }
        self.pending_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn has_input(&self, allow_interrupts: bool) -> bool {
        let interrupts = allow_interrupts
            && !self
                .interrupt_messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty();
        interrupts
            || !self
                .pending_messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }

    // Planning

    pub fn set_planning_phase(&self, active: bool) {
        self.planning_phase.store(active, Ordering::SeqCst);
    }

    pub fn is_planning_phase(&self) -> bool {
        self.planning_phase.load(Ordering::SeqCst)
    }

    // Streamed tool call

    pub fn with_tool_call<R>(&self, f: impl FnOnce(&mut Option<PendingToolCall>) -> R) -> R {
        let mut slot = self.tool_call.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut slot)
    }

    // Timers

    /// Run `action` after `delay`. At most one timer is armed per task;
    /// arming replaces (aborts) whichever was pending.
    pub fn arm_timer<F>(self: &Arc<Self>, kind: TimerKind, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_disposed() {
            return;
        }
        let id = self.timer_ids.fetch_add(1, Ordering::SeqCst);
        let ctx = Arc::clone(self);

        // Held across the spawn so a zero-delay timer cannot clear its slot
        // before it has been filled
        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            ctx.clear_fired_timer(id);
            action.await;
        });
        let previous = slot.replace(ArmedTimer { kind, id, handle });
        drop(slot);

        if let Some(previous) = previous {
            previous.handle.abort();
        }
        debug!(task_id = %self.task_id, ?kind, ?delay, "timer armed");
    }

    fn clear_fired_timer(&self, id: u64) {
        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|t| t.id == id) {
            *slot = None;
        }
    }

    pub fn disarm_timer(&self) {
        let armed = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(armed) = armed {
            armed.handle.abort();
            debug!(task_id = %self.task_id, kind = ?armed.kind, "timer disarmed");
        }
    }

    pub fn armed_timer(&self) -> Option<TimerKind> {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.kind)
    }
}

impl Drop for RuntimeTaskContext {
    fn drop(&mut self) {
        let armed = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(armed) = armed {
            armed.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupts_jump_the_queue_when_allowed() {
        let ctx = RuntimeTaskContext::new("t");
        ctx.push_message("first");
        ctx.push_interrupt("stop that");
        ctx.push_message("second");

        assert_eq!(ctx.next_input(true).as_deref(), Some("stop that"));
        assert_eq!(ctx.next_input(true).as_deref(), Some("first"));

        ctx.push_interrupt("ignored");
        assert_eq!(ctx.next_input(false).as_deref(), Some("second"));
        assert!(!ctx.has_input(false));
        assert!(ctx.has_input(true));
    }

    #[test]
    fn snapshots_are_copies() {
        let ctx = RuntimeTaskContext::new("t");
        ctx.add_locked_file("/p/a.rs");
        let files = ctx.locked_files();
        ctx.add_locked_file("/p/b.rs");
        assert_eq!(files, vec!["/p/a.rs".to_string()]);
        assert_eq!(ctx.locked_files().len(), 2);
        assert!(!ctx.add_locked_file("/p/a.rs"));
    }

    #[test]
    fn finalize_is_claimed_once() {
        let ctx = RuntimeTaskContext::new("t");
        assert!(ctx.begin_finalize());
        assert!(!ctx.begin_finalize());
    }

    #[test]
    fn output_since_offset() {
        let ctx = RuntimeTaskContext::new("t");
        ctx.append_output("one");
        let start = ctx.output_len();
        ctx.append_output("two\n");
        assert_eq!(ctx.output_since(start), "two\n");
        assert_eq!(ctx.output_since(9999), "");
    }

    #[tokio::test]
    async fn arming_one_timer_aborts_the_other() {
        let ctx = RuntimeTaskContext::new("t");
        let fired = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&fired);
        ctx.arm_timer(TimerKind::Iteration, Duration::from_millis(50), async move {
            sink.lock().unwrap().push(TimerKind::Iteration);
        });
        let sink = Arc::clone(&fired);
        ctx.arm_timer(TimerKind::Retry, Duration::from_millis(10), async move {
            sink.lock().unwrap().push(TimerKind::Retry);
        });
        assert_eq!(ctx.armed_timer(), Some(TimerKind::Retry));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*fired.lock().unwrap(), vec![TimerKind::Retry]);
        assert_eq!(ctx.armed_timer(), None);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_stops_timers() {
        let ctx = RuntimeTaskContext::new("t");
        let fired = Arc::new(AtomicBool::new(false));
        let sink = Arc::clone(&fired);
        ctx.arm_timer(TimerKind::Retry, Duration::from_millis(20), async move {
            sink.store(true, Ordering::SeqCst);
        });

        ctx.dispose();
        ctx.dispose();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));

        // Disposed contexts refuse new timers
        ctx.arm_timer(TimerKind::Iteration, Duration::from_millis(1), async {});
        assert_eq!(ctx.armed_timer(), None);
    }
}
