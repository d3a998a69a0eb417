//! Run lifecycle: launch, output reading, exit handling and finalisation.

use super::command::{build_invocation_command, build_process_launch_script_for, ScriptFlavor};
use super::process::spawn_script;
use super::prompt::{
    build_continuation_prompt, build_followup_prompt, build_full_prompt,
    build_iteration_instructions, build_resume_prompt, format_completion_summary,
};
use super::stream::{parse_line, StreamEvent};
use super::{classify, LaunchKind, TaskOrchestrator};
use crate::arbiter::fragment::{extract_string_field, FILE_PATH_KEY};
use crate::arbiter::{try_extract_file_path_from_partial, LockOutcome};
use crate::context::{PendingToolCall, RuntimeTaskContext, TimerKind};
use crate::db::now_ms;
use crate::error::ConductorError;
use crate::task::TaskHandle;
use crate::types::{Task, TaskStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, error, info, warn};

/// How a run ended, as seen by the exit handler.
struct RunExit {
    kind: LaunchKind,
    generation: u64,
    code: Option<i32>,
    /// Offset into the accumulated output where this run's output begins.
    output_start: usize,
}

impl TaskOrchestrator {
    /// Spawn a run of the agent for `handle`.
    pub(super) fn launch(self: &Arc<Self>, handle: &TaskHandle, kind: LaunchKind) {
        let this = Arc::clone(self);
        let handle = handle.clone();
        tokio::spawn(async move {
            this.run_agent(handle, kind).await;
        });
    }

    async fn run_agent(self: Arc<Self>, handle: TaskHandle, kind: LaunchKind) {
        let task_id = handle.id().to_string();
        let Some(ctx) = self.context(&task_id) else {
            debug!(task_id = %task_id, ?kind, "launch skipped, task has finished");
            return;
        };
        if ctx.is_cancelled() || !handle.status().is_running() {
            debug!(task_id = %task_id, ?kind, "launch skipped, task not running");
            return;
        }

        let generation = ctx.next_generation();
        let output_start = ctx.output_len();
        if !matches!(kind, LaunchKind::FollowUp(_)) {
            handle.update(|t| t.last_iteration_output_start = output_start);
        }

        let task = handle.snapshot();
        let prompt = self.prompt_for(&task, &kind);
        let files = match self.write_run_files(&task, generation, &prompt).await {
            Ok(files) => files,
            Err(err) => {
                self.fail_launch(&handle, ConductorError::launch_failed(&task_id, err));
                return;
            }
        };

        let mut child = match spawn_script(&files.script, &task.project_path) {
            Ok(child) => child,
            Err(err) => {
                files.remove().await;
                self.fail_launch(&handle, ConductorError::launch_failed(&task_id, err));
                return;
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            ctx.set_process(pid);
        }
        info!(task_id = %task_id, ?pid, generation, ?kind, "agent launched");

        // Cancelled between the status check and the spawn
        if ctx.is_cancelled() || ctx.generation() != generation {
            ctx.stop_process();
        }

        let stderr_reader = child.stderr.take().map(|stderr| {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { read_plain(stderr, &ctx).await })
        });
        if let Some(stdout) = child.stdout.take() {
            self.read_stream(stdout, &handle, &ctx, generation).await;
        }

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "failed to wait for agent");
                None
            }
        };
        if let Some(reader) = stderr_reader {
            let _ = reader.await;
        }
        if let Some(pid) = pid {
            ctx.clear_process(pid);
        }
        files.remove().await;

        // The holder may have finished before this task entered the queue
        if handle.status().is_queued() {
            let waiting = self.waiting_paths();
            let promoted = self.arbiter.check_queued_tasks();
            self.relaunch_promoted(promoted, &waiting);
        }

        debug!(task_id = %task_id, ?code, generation, "agent exited");
        self.handle_exit(
            &handle,
            &ctx,
            RunExit {
                kind,
                generation,
                code,
                output_start,
            },
        );
    }

    fn prompt_for(&self, task: &Task, kind: &LaunchKind) -> String {
        let iteration_instructions = task.flags.iterate_until_done.then(|| {
            build_iteration_instructions(&self.config.agent.completion_marker, task.max_iterations)
        });

        match kind {
            LaunchKind::Initial => {
                let system_prompt = [
                    self.config.agent.system_prompt.clone(),
                    iteration_instructions,
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join("\n\n");
                let description = self.project_description(&task.project_path);
                build_full_prompt(&system_prompt, task, description.as_deref())
            }
            LaunchKind::Continuation => {
                let mut sections: Vec<String> = iteration_instructions.into_iter().collect();
                sections.push(build_continuation_prompt(
                    task.current_iteration,
                    task.max_iterations,
                ));
                sections.push(format!("TASK:\n{}", task.description.trim()));
                sections.join("\n\n")
            }
            LaunchKind::Resume(freed) => build_resume_prompt(&task.description, freed.as_deref()),
            LaunchKind::FollowUp(message) => build_followup_prompt(&task.description, message),
        }
    }

    /// Launch script for `task` reading its prompt from `prompt_file`.
    pub fn render_launch_script(&self, task: &Task, prompt_file: &Path, flavor: ScriptFlavor) -> String {
        // Output is always consumed as a stream; there is no terminal to attach
        let mut flags = task.flags;
        flags.headless = true;
        let command = build_invocation_command(&self.config.agent.command, task.model.as_deref(), &flags);
        build_process_launch_script_for(
            flavor,
            &task.project_path,
            &prompt_file.to_string_lossy(),
            &command,
        )
    }

    async fn write_run_files(
        &self,
        task: &Task,
        generation: u64,
        prompt: &str,
    ) -> std::io::Result<RunFiles> {
        let dir = &self.config.agent.script_dir;
        tokio::fs::create_dir_all(dir).await?;

        let flavor = ScriptFlavor::native();
        let stem = format!("{}-{}", task.id, generation);
        let files = RunFiles {
            prompt: dir.join(format!("{}.md", stem)),
            script: dir.join(format!("{}.{}", stem, flavor.extension())),
        };

        tokio::fs::write(&files.prompt, prompt).await?;
        let script = self.render_launch_script(task, &files.prompt, flavor);
        tokio::fs::write(&files.script, script).await?;
        Ok(files)
    }

    // Output

    async fn read_stream<R>(&self, stdout: R, handle: &TaskHandle, ctx: &Arc<RuntimeTaskContext>, generation: u64)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                read = reader.read_until(b'\n', &mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(task_id = handle.id(), error = %err, "stdout read failed");
                    break;
                }
            }
            let line = decode_line(&buf);
            ctx.append_output(&line);
            if ctx.generation() != generation {
                break;
            }

            let mut keep_reading = true;
            for event in parse_line(&line) {
                if !self.handle_stream_event(handle, ctx, event) {
                    keep_reading = false;
                    break;
                }
            }
            if !keep_reading {
                break;
            }
        }
    }

    /// Returns `false` once the run has been stopped.
    fn handle_stream_event(&self, handle: &TaskHandle, ctx: &RuntimeTaskContext, event: StreamEvent) -> bool {
        match event {
            StreamEvent::ToolUseStart { index, name, file_path } => {
                let attempted = file_path.is_some();
                ctx.with_tool_call(|slot| {
                    *slot = Some(PendingToolCall {
                        block_index: index,
                        tool_name: Some(name.clone()),
                        partial_input: String::new(),
                        lock_attempted: attempted,
                    })
                });
                match file_path {
                    Some(path) => self.on_write_intent(handle, ctx, &name, &path),
                    None => true,
                }
            }
            StreamEvent::ToolInputDelta { index, partial_json } => {
                let ready = ctx.with_tool_call(|slot| {
                    let call = slot.as_mut()?;
                    if index.is_some() && call.block_index.is_some() && call.block_index != index {
                        return None;
                    }
                    call.partial_input.push_str(&partial_json);
                    if call.lock_attempted {
                        return None;
                    }
                    let field = extract_string_field(&call.partial_input, FILE_PATH_KEY)?;
                    if !field.complete {
                        return None;
                    }
                    call.lock_attempted = true;
                    Some((call.tool_name.clone().unwrap_or_default(), field.value))
                });
                match ready {
                    Some((tool, path)) => self.on_write_intent(handle, ctx, &tool, &path),
                    None => true,
                }
            }
            StreamEvent::BlockStop { index } => {
                let ready = ctx.with_tool_call(|slot| {
                    if slot.as_ref().is_some_and(|c| index.is_some() && c.block_index.is_some() && c.block_index != index) {
                        return None;
                    }
                    let call = slot.take()?;
                    if call.lock_attempted {
                        return None;
                    }
                    let tool = call.tool_name.unwrap_or_default();
                    match try_extract_file_path_from_partial(&call.partial_input) {
                        Some(path) => Some((tool, path)),
                        None => {
                            if self.config.agent.write_tools.iter().any(|w| *w == tool) {
                                let err = ConductorError::malformed_fragment(&format!(
                                    "{} input has no file_path",
                                    tool
                                ));
                                debug!(task_id = handle.id(), code = ?err.code, error = %err, "tool call dropped");
                            }
                            None
                        }
                    }
                });
                match ready {
                    Some((tool, path)) => self.on_write_intent(handle, ctx, &tool, &path),
                    None => true,
                }
            }
            StreamEvent::ToolUse { name, file_path: Some(path) } => {
                self.on_write_intent(handle, ctx, &name, &path)
            }
            StreamEvent::Fragment { name: Some(name), file_path } => {
                self.on_write_intent(handle, ctx, &name, &file_path)
            }
            StreamEvent::ToolUse { file_path: None, .. } | StreamEvent::Fragment { name: None, .. } => true,
            StreamEvent::Result { is_error, text, usage } => {
                handle.update(|t| {
                    if let Some(usage) = &usage {
                        t.tokens.add(usage);
                    }
                    if let Some(text) = text.as_ref().filter(|s| !s.trim().is_empty()) {
                        t.summary = Some(text.trim().to_string());
                    }
                });
                if is_error {
                    debug!(task_id = handle.id(), "agent reported an error result");
                }
                true
            }
        }
    }

    /// Lock the target of a write-class tool. On conflict the task has been
    /// queued by the arbiter; its process is stopped so it cannot write.
    fn on_write_intent(&self, handle: &TaskHandle, ctx: &RuntimeTaskContext, tool: &str, raw_path: &str) -> bool {
        if !self.config.agent.write_tools.iter().any(|w| w == tool) {
            return true;
        }

        let project = handle.read(|t| t.project_path.clone());
        match self.arbiter.acquire_or_queue(handle.id(), raw_path, &project, tool) {
            LockOutcome::Acquired => {
                ctx.add_locked_file(&self.arbiter.normalize_path(raw_path, &project));
                true
            }
            LockOutcome::Conflict { owner_task_id } => {
                if !handle.status().is_queued() {
                    return true;
                }
                ctx.stop_process();
                let err = ConductorError::lock_conflict(handle.id(), raw_path, &owner_task_id);
                info!(
                    task_id = handle.id(),
                    code = ?err.code,
                    error = %err,
                    "agent stopped while waiting for file"
                );
                false
            }
        }
    }

    // Exit

    fn handle_exit(self: &Arc<Self>, handle: &TaskHandle, ctx: &Arc<RuntimeTaskContext>, exit: RunExit) {
        let task_id = handle.id();
        if exit.generation != ctx.generation() || ctx.is_cancelled() || handle.is_finished() {
            debug!(task_id, generation = exit.generation, "stale exit ignored");
            return;
        }
        if handle.status().is_queued() {
            return;
        }

        let iterative = handle.read(|t| t.flags.iterate_until_done);

        if exit.code != Some(0) {
            let run_output = ctx.output_since(exit.output_start);
            if classify::is_transient_rate_or_token_limit_error(&run_output) {
                self.schedule_retry(handle, ctx, exit.kind);
                return;
            }

            let code_text = match exit.code {
                Some(code) => format!("Agent exited with code {}", code),
                None => "Agent was terminated by a signal".to_string(),
            };

            if iterative {
                let failures = handle.update(|t| {
                    t.consecutive_failures += 1;
                    t.consecutive_failures
                });
                let limit = self.config.retry.max_consecutive_failures;
                if failures >= limit {
                    self.finalize(
                        handle,
                        TaskStatus::Failed,
                        Some(format!("{} ({} consecutive failed iterations)", code_text, failures)),
                    );
                } else {
                    warn!(task_id, failures, limit, "iteration failed");
                    self.schedule_iteration(handle, ctx);
                }
                return;
            }

            self.finalize(handle, TaskStatus::Failed, Some(code_text));
            return;
        }

        ctx.reset_token_limit_retries();
        handle.update(|t| t.consecutive_failures = 0);

        let allow_interrupts = handle.read(|t| t.allow_interrupts);
        if let Some(message) = ctx.next_input(allow_interrupts) {
            info!(task_id, "delivering queued message");
            self.launch(handle, LaunchKind::FollowUp(message));
            return;
        }

        if !iterative {
            self.finalize(handle, TaskStatus::Completed, None);
            return;
        }

        let (iteration, max, start) = handle.read(|t| {
            (t.current_iteration, t.max_iterations, t.last_iteration_output_start)
        });
        if ctx.output_since(start).contains(&self.config.agent.completion_marker) {
            self.finalize(
                handle,
                TaskStatus::Completed,
                Some(format!("Finished after {} iterations", iteration)),
            );
        } else if iteration >= max {
            self.finalize(
                handle,
                TaskStatus::Completed,
                Some(format!("Stopped at the iteration limit ({}/{})", iteration, max)),
            );
        } else {
            self.schedule_iteration(handle, ctx);
        }
    }

    fn schedule_iteration(self: &Arc<Self>, handle: &TaskHandle, ctx: &Arc<RuntimeTaskContext>) {
        let (iteration, max) = handle.update(|t| {
            t.current_iteration = (t.current_iteration + 1).min(t.max_iterations);
            (t.current_iteration, t.max_iterations)
        });
        info!(task_id = handle.id(), iteration, max, "next iteration scheduled");

        let this = Arc::clone(self);
        let target = handle.clone();
        ctx.arm_timer(TimerKind::Iteration, self.config.retry.iteration_delay(), async move {
            this.launch(&target, LaunchKind::Continuation);
        });
    }

    /// Re-run the invocation that hit the limit, with the same prompt.
    fn schedule_retry(self: &Arc<Self>, handle: &TaskHandle, ctx: &Arc<RuntimeTaskContext>, kind: LaunchKind) {
        let attempt = ctx.record_token_limit_retry();
        let max = self.config.retry.max_token_limit_retries;
        if attempt > max {
            let err = ConductorError::transient_limit(handle.id(), max);
            self.finalize(handle, TaskStatus::Failed, Some(err.message));
            return;
        }

        let delay = self.config.retry.backoff(attempt);
        info!(task_id = handle.id(), attempt, max, ?delay, ?kind, "rate or token limit, retry scheduled");

        let this = Arc::clone(self);
        let target = handle.clone();
        ctx.arm_timer(TimerKind::Retry, delay, async move {
            this.launch(&target, kind);
        });
    }

    fn fail_launch(self: &Arc<Self>, handle: &TaskHandle, err: ConductorError) {
        error!(task_id = handle.id(), error = %err, "agent launch failed");
        self.finalize(handle, TaskStatus::Failed, Some(err.to_string()));
    }

    // Finalisation

    /// Drive a task to `status` exactly once: disarm timers, kill the process
    /// tree, stamp the status, release locks, then relaunch promoted waiters.
    /// Returns `false` if another caller got there first.
    pub(super) fn finalize(self: &Arc<Self>, handle: &TaskHandle, status: TaskStatus, extra: Option<String>) -> bool {
        let task_id = handle.id().to_string();
        if handle.is_finished() {
            return false;
        }
        // The context leaves the map only once the status is terminal
        let Some(ctx) = self.context(&task_id) else {
            return false;
        };
        if !ctx.begin_finalize() {
            return false;
        }
        ctx.dispose();

        let mut notes: Vec<String> = extra.into_iter().collect();
        if status == TaskStatus::Completed && ctx.is_planning_phase() {
            notes.push("Plan ready for review.".to_string());
        }
        let locked_files = ctx.locked_files();
        if !locked_files.is_empty() {
            notes.push(format!("Files written: {}", locked_files.join(", ")));
        }

        let duration_ms = handle.read(|t| (now_ms() - t.start_time).max(0));
        let summary = format_completion_summary(
            status,
            Duration::from_millis(duration_ms as u64),
            Some(&notes.join("\n")),
        );
        let output = ctx.output();

        let changed = handle.update(|t| {
            if !t.transition(status) {
                return false;
            }
            t.completion_summary = Some(summary);
            if !output.is_empty() {
                t.full_output = Some(output);
            }
            true
        });
        self.drop_context(&task_id);
        if !changed {
            return false;
        }
        info!(task_id = %task_id, status = %status, "task finished");

        let waiting = self.waiting_paths();
        let report = self.arbiter.release(&task_id);
        self.relaunch_promoted(report.promoted, &waiting);
        self.persist_history(handle.snapshot());
        true
    }

    /// Queued task id -> (normalized path, original path) it waits for.
    pub(super) fn waiting_paths(&self) -> HashMap<String, (Option<String>, Option<String>)> {
        self.arbiter
            .queued()
            .into_iter()
            .map(|q| (q.task_id, (q.conflicting_path, q.original_path)))
            .collect()
    }

    pub(super) fn relaunch_promoted(
        self: &Arc<Self>,
        promoted: Vec<String>,
        waiting: &HashMap<String, (Option<String>, Option<String>)>,
    ) {
        for task_id in promoted {
            let Some(handle) = self.registry.get(&task_id) else {
                continue;
            };
            let Some(ctx) = self.context(&task_id) else {
                debug!(task_id = %task_id, "promoted task has no runtime context");
                continue;
            };
            let (normalized, original) = waiting.get(&task_id).cloned().unwrap_or_default();
            if let Some(path) = &normalized {
                ctx.add_locked_file(path);
            }

            // Never ran: dependencies held it back from the start
            let kind = if ctx.generation() == 0 {
                LaunchKind::Initial
            } else {
                LaunchKind::Resume(original)
            };
            info!(task_id = %task_id, ?kind, "relaunching promoted task");
            self.launch(&handle, kind);
        }
    }

    /// Save one finished task to the history store in the background.
    fn persist_history(&self, task: Task) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no runtime available, history not saved");
            return;
        };
        runtime.spawn(async move {
            let task_id = task.id.clone();
            if let Err(err) = store.save_history(vec![task]).await {
                warn!(task_id = %task_id, error = %err, "failed to save task history");
            }
        });
    }
}

struct RunFiles {
    prompt: PathBuf,
    script: PathBuf,
}

impl RunFiles {
    async fn remove(&self) {
        for path in [&self.prompt, &self.script] {
            if let Err(err) = tokio::fs::remove_file(path).await {
                debug!(path = %path.display(), error = %err, "could not remove run file");
            }
        }
    }
}

async fn read_plain<R>(reader: R, ctx: &RuntimeTaskContext)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => ctx.append_output(&decode_line(&buf)),
        }
    }
}

/// One line of agent output. Invalid UTF-8 is replaced, not rejected.
fn decode_line(buf: &[u8]) -> String {
    String::from_utf8_lossy(buf)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}
