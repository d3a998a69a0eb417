//! End-to-end tests for the task orchestrator.
//!
//! Each test writes a small bash "agent" into a scratch directory and points
//! the configured agent command at it. The agent reads its prompt from stdin,
//! counts its runs in `runs`, saves each prompt as `prompt-N` and its
//! arguments as `args-N`, then runs the test-specific body.

#![cfg(unix)]

use agent_conductor::config::Config;
use agent_conductor::db::{Database, SqliteTaskStore, TaskStore};
use agent_conductor::error::ErrorCode;
use agent_conductor::orchestrator::{TaskOrchestrator, SUMMARY_HEADER};
use agent_conductor::types::{Task, TaskFlags, TaskRequest, TaskStatus};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

const PREAMBLE: &str = r#"#!/bin/bash
prompt=$(cat)
here="$(cd "$(dirname "$0")" && pwd)"
n=$(( $(cat "$here/runs" 2>/dev/null || echo 0) + 1 ))
echo "$n" > "$here/runs"
printf '%s' "$prompt" > "$here/prompt-$n"
printf '%s' "$*" > "$here/args-$n"
result() {
  printf '{"type":"result","subtype":"success","is_error":false,"result":"%s","usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":3,"cache_creation_input_tokens":1}}\n' "$1"
}
write_tool() {
  printf '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"%s","content":"x"}}]}}\n' "$1"
}
"#;

struct Harness {
    dir: TempDir,
    orchestrator: Arc<TaskOrchestrator>,
}

impl Harness {
    fn project(&self) -> String {
        self.dir.path().join("project").display().to_string()
    }

    fn runs(&self) -> u32 {
        std::fs::read_to_string(self.dir.path().join("runs"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn prompt(&self, run: u32) -> String {
        std::fs::read_to_string(self.dir.path().join(format!("prompt-{}", run))).unwrap_or_default()
    }

    fn args(&self, run: u32) -> String {
        std::fs::read_to_string(self.dir.path().join(format!("args-{}", run))).unwrap_or_default()
    }

    fn request(&self, description: &str) -> TaskRequest {
        TaskRequest::new(description, self.project())
    }

    async fn wait(&self, task_id: &str) -> Task {
        timeout(Duration::from_secs(30), self.orchestrator.wait_for_terminal(task_id))
            .await
            .expect("task did not finish in time")
            .expect("task exists")
    }
}

/// Scratch directory holding the fake agent and a project directory.
fn setup_agent(body: &str) -> (TempDir, Config) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let agent = dir.path().join("agent.sh");
    std::fs::write(&agent, format!("{}{}\n", PREAMBLE, body)).expect("Failed to write agent");
    std::fs::create_dir_all(dir.path().join("project")).expect("Failed to create project dir");

    let mut config = Config::default();
    // Run through bash so the file never needs an exec bit
    config.agent.command = format!("bash {}", agent.display());
    config.agent.script_dir = dir.path().join("scripts");
    config.retry.base_delay_seconds = 0;
    config.retry.max_delay_seconds = 0;
    config.retry.iteration_delay_seconds = 0;
    (dir, config)
}

fn setup_harness(body: &str) -> Harness {
    setup_harness_with(body, |_| {}, None)
}

fn setup_harness_with(
    body: &str,
    adjust: impl FnOnce(&mut Config),
    store: Option<Arc<dyn TaskStore>>,
) -> Harness {
    let (dir, mut config) = setup_agent(body);
    adjust(&mut config);
    Harness {
        dir,
        orchestrator: TaskOrchestrator::new(config, store),
    }
}

fn setup_store() -> Arc<dyn TaskStore> {
    let db = Database::open_in_memory().expect("Failed to create in-memory database");
    Arc::new(SqliteTaskStore::new(db))
}

/// Record every status a task moves through.
fn record_statuses(orchestrator: &TaskOrchestrator, task_id: &str) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    orchestrator
        .task(task_id)
        .expect("task exists")
        .subscribe_field("status", move |event| {
            if let Value::String(status) = &event.new {
                sink.lock().unwrap().push(status.clone());
            }
        });
    seen
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

mod run_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn successful_run_completes_with_summary_and_tokens() {
        let h = setup_harness(r#"result "Fixed login bug""#);

        let handle = h.orchestrator.create_task(h.request("Fix the login bug")).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.summary.as_deref(), Some("Fixed login bug"));
        assert_eq!(task.tokens.input, 10);
        assert_eq!(task.tokens.output, 5);
        assert_eq!(task.tokens.cache_read, 3);
        assert_eq!(task.tokens.cache_creation, 1);
        assert!(task.end_time.is_some());

        let completion = task.completion_summary.unwrap();
        assert!(completion.starts_with(SUMMARY_HEADER));
        assert!(completion.contains("Completed"));
        assert!(task.full_output.unwrap().contains("\"type\":\"result\""));

        assert_eq!(h.runs(), 1);
        assert!(h.prompt(1).contains("TASK:\nFix the login bug"));
        assert!(h.args(1).contains("-p --output-format stream-json --verbose"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_files_are_removed_after_exit() {
        let h = setup_harness(r#"result "ok""#);

        let handle = h.orchestrator.create_task(h.request("Tidy")).unwrap();
        h.wait(handle.id()).await;

        let leftovers = std::fs::read_dir(h.dir.path().join("scripts"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nonzero_exit_fails_the_task() {
        let h = setup_harness("echo 'compilation error'\nexit 2");

        let handle = h.orchestrator.create_task(h.request("Break it")).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completion_summary.unwrap().contains("Agent exited with code 2"));
        assert_eq!(h.runs(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn plan_only_passes_plan_mode_and_notes_review() {
        let h = setup_harness(r#"result "Plan written""#);

        let mut request = h.request("Plan the refactor");
        request.flags = TaskFlags { plan_only: true, ..Default::default() };
        let handle = h.orchestrator.create_task(request).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(h.args(1).contains("--permission-mode plan"));
        assert!(h.prompt(1).contains("PLAN ONLY:"));
        assert!(task.completion_summary.unwrap().contains("Plan ready for review."));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn launch_failure_fails_the_task() {
        let h = setup_harness_with(
            r#"result "never""#,
            |config| {
                // A regular file where the script directory's parent should be
                let blocker = config.agent.script_dir.with_file_name("blocker");
                std::fs::write(&blocker, "").unwrap();
                config.agent.script_dir = blocker.join("scripts");
            },
            None,
        );

        let handle = h.orchestrator.create_task(h.request("Cannot start")).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completion_summary.unwrap().contains("Failed to launch agent process"));
        assert_eq!(h.runs(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_utf8_on_stdout_is_tolerated() {
        let h = setup_harness(
            r#"printf 'bad \377 byte\n'
seq 1 2000
write_tool "after.rs"
result "done""#,
        );

        let handle = h.orchestrator.create_task(h.request("Noisy output")).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.summary.as_deref(), Some("done"));
        let output = task.full_output.unwrap();
        assert!(output.contains("bad \u{FFFD} byte"));
        assert!(output.contains("\n2000\n"));
        // Writes after the bad byte are still locked
        assert!(task.completion_summary.unwrap().contains("after.rs"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_utf8_on_stderr_is_tolerated() {
        let h = setup_harness(
            r#"printf 'bad \377 byte\n' >&2
seq 1 2000 >&2
result "done""#,
        );

        let handle = h.orchestrator.create_task(h.request("Noisy errors")).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.full_output.unwrap().contains("\n2000\n"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn project_path_is_frozen_at_creation() {
        let h = setup_harness(r#"result "ok""#);
        let first = h.project();
        let second = h.dir.path().join("other").display().to_string();
        std::fs::create_dir_all(&second).unwrap();

        h.orchestrator.set_active_project(first.as_str());
        let handle = h.orchestrator.create_task(TaskRequest::new("Uses the active project", "")).unwrap();
        h.orchestrator.set_active_project(second.as_str());

        let task = h.wait(handle.id()).await;
        assert_eq!(task.project_path, first);
        assert_eq!(task.project_name, "project");
    }
}

mod retry_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limit_retries_then_succeeds() {
        let h = setup_harness(
            r#"if [ "$n" -lt 2 ]; then echo "Error: rate limit exceeded"; exit 1; fi
result "done""#,
        );

        let handle = h.orchestrator.create_task(h.request("Flaky")).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.runs(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limit_retries_are_bounded() {
        let h = setup_harness_with(
            "echo 'Error: rate limit exceeded'\nexit 1",
            |config| config.retry.max_token_limit_retries = 2,
            None,
        );

        let handle = h.orchestrator.create_task(h.request("Always limited")).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .completion_summary
            .unwrap()
            .contains("Rate or token limit hit after 2 retries"));
        // Initial run plus two retries
        assert_eq!(h.runs(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limited_follow_up_keeps_its_message() {
        let h = setup_harness(
            r#"if [ "$n" -eq 1 ]; then sleep 0.5; fi
if [ "$n" -eq 2 ]; then echo "Error: rate limit exceeded"; exit 1; fi
result "run $n""#,
        );

        let handle = h.orchestrator.create_task(h.request("Write docs")).unwrap();
        h.orchestrator.send_message(handle.id(), "also update the changelog").unwrap();

        let task = h.wait(handle.id()).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.runs(), 3);
        assert!(h.prompt(2).contains("also update the changelog"));
        assert_eq!(h.prompt(3), h.prompt(2));
    }
}

mod iteration_tests {
    use super::*;

    fn iterative(h: &Harness, description: &str, max: u32) -> TaskRequest {
        let mut request = h.request(description);
        request.flags = TaskFlags { iterate_until_done: true, ..Default::default() };
        request.max_iterations = Some(max);
        request
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completion_marker_ends_the_loop() {
        let h = setup_harness(
            r#"if [ "$n" -ge 3 ]; then echo "TASK_COMPLETE"; fi
result "pass $n""#,
        );

        let handle = h.orchestrator.create_task(iterative(&h, "Make tests pass", 10)).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.runs(), 3);
        assert_eq!(task.current_iteration, 3);
        assert!(h.prompt(2).contains("iteration 2/10"));
        assert!(h.prompt(1).contains("TASK_COMPLETE"));
        assert!(task.completion_summary.unwrap().contains("Finished after 3 iterations"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limited_iteration_is_retried_as_the_same_iteration() {
        let h = setup_harness(
            r#"if [ "$n" -eq 2 ]; then echo "Error: rate limit exceeded"; exit 1; fi
if [ "$n" -ge 3 ]; then echo "TASK_COMPLETE"; fi
result "pass $n""#,
        );

        let handle = h.orchestrator.create_task(iterative(&h, "Make tests pass", 5)).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.runs(), 3);
        assert_eq!(task.current_iteration, 2);
        assert!(h.prompt(2).contains("iteration 2/5"));
        assert!(h.prompt(3).contains("iteration 2/5"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn iteration_limit_stops_the_loop() {
        let h = setup_harness(r#"result "still going""#);

        let handle = h.orchestrator.create_task(iterative(&h, "Endless", 2)).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.runs(), 2);
        assert!(task.completion_summary.unwrap().contains("iteration limit"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consecutive_failures_fail_the_loop() {
        let h = setup_harness_with(
            "exit 3",
            |config| config.retry.max_consecutive_failures = 2,
            None,
        );

        let handle = h.orchestrator.create_task(iterative(&h, "Broken", 10)).unwrap();
        let task = h.wait(handle.id()).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(h.runs(), 2);
        assert!(task.completion_summary.unwrap().contains("consecutive failed iterations"));
    }
}

mod control_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_is_idempotent() {
        let h = setup_harness("sleep 30\nresult \"late\"");

        let handle = h.orchestrator.create_task(h.request("Long job")).unwrap();
        sleep(Duration::from_millis(300)).await;

        assert!(h.orchestrator.cancel(handle.id()).unwrap());
        assert!(!h.orchestrator.cancel(handle.id()).unwrap());

        let task = h.wait(handle.id()).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.completion_summary.unwrap().contains("Cancelled by user"));

        // The killed run must not relaunch or change the status
        sleep(Duration::from_millis(300)).await;
        assert_eq!(h.runs(), 1);
        assert_eq!(handle.status(), TaskStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cancels_finish_and_release_once() {
        let h = setup_harness("write_tool \"held.rs\"\nsleep 30");

        let handle = h.orchestrator.create_task(h.request("Holder")).unwrap();
        sleep(Duration::from_millis(300)).await;
        assert_eq!(h.orchestrator.locks().len(), 1);

        let releases = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&releases);
        h.orchestrator.arbiter().subscribe(move |event| {
            if event.field == "owner_task_id" && event.new.is_null() {
                *sink.lock().unwrap() += 1;
            }
        });
        let seen = record_statuses(&h.orchestrator, handle.id());

        let cancels: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = Arc::clone(&h.orchestrator);
                let task_id = handle.id().to_string();
                tokio::spawn(async move { orchestrator.cancel(&task_id).unwrap() })
            })
            .collect();
        let mut won = 0;
        for cancel in cancels {
            if cancel.await.unwrap() {
                won += 1;
            }
        }

        assert_eq!(won, 1);
        assert_eq!(*releases.lock().unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["Cancelled".to_string()]);
        assert!(h.orchestrator.locks().is_empty());

        // The killed run's exit must not bring the runtime context back
        sleep(Duration::from_millis(300)).await;
        assert!(h.orchestrator.context(handle.id()).is_none());
        assert_eq!(h.runs(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_unknown_task_is_an_error() {
        let h = setup_harness(r#"result "ok""#);
        let err = h.orchestrator.cancel("0000000000000000").unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskNotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_holds_the_process_until_resume() {
        let h = setup_harness("sleep 1\nresult \"woke up\"");

        let handle = h.orchestrator.create_task(h.request("Sleepy")).unwrap();
        sleep(Duration::from_millis(300)).await;

        assert!(h.orchestrator.pause(handle.id()).unwrap());
        assert_eq!(handle.status(), TaskStatus::Paused);

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(handle.status(), TaskStatus::Paused);

        assert!(h.orchestrator.resume(handle.id()).unwrap());
        let task = h.wait(handle.id()).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.summary.as_deref(), Some("woke up"));
        assert_eq!(h.runs(), 1);

        // Finished tasks ignore pause and resume
        assert!(!h.orchestrator.pause(handle.id()).unwrap());
        assert!(!h.orchestrator.resume(handle.id()).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn queued_messages_become_follow_up_runs() {
        let h = setup_harness(
            r#"if [ "$n" -eq 1 ]; then sleep 0.5; fi
result "run $n""#,
        );

        let handle = h.orchestrator.create_task(h.request("Write docs")).unwrap();
        h.orchestrator.send_message(handle.id(), "also update the changelog").unwrap();
        h.orchestrator.send_interrupt(handle.id(), "stop and fix the typo first").unwrap();

        let task = h.wait(handle.id()).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(h.runs(), 3);
        assert!(h.prompt(2).contains("stop and fix the typo first"));
        assert!(h.prompt(3).contains("also update the changelog"));
        assert!(h.prompt(3).contains("Write docs"));
        assert_eq!(task.summary.as_deref(), Some("run 3"));
        assert_eq!(task.tokens.input, 30);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn messages_to_finished_tasks_are_rejected() {
        let h = setup_harness(r#"result "ok""#);
        let handle = h.orchestrator.create_task(h.request("Quick")).unwrap();
        h.wait(handle.id()).await;

        let err = h.orchestrator.send_message(handle.id(), "too late").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
    }
}

mod lock_tests {
    use super::*;

    const CONTENDED: &str = r#"case "$prompt" in
  *"first writer"*) write_tool "shared.rs"; sleep 1 ;;
  *) sleep 0.3; write_tool "shared.rs"; sleep 0.2 ;;
esac
result "wrote shared.rs""#;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn conflicting_writer_waits_then_resumes() {
        let h = setup_harness(CONTENDED);

        let first = h.orchestrator.create_task(h.request("first writer")).unwrap();
        let second = h.orchestrator.create_task(h.request("second writer")).unwrap();
        let seen = record_statuses(&h.orchestrator, second.id());

        sleep(Duration::from_millis(600)).await;
        let waiting = second.snapshot();
        assert_eq!(waiting.status, TaskStatus::Queued);
        assert_eq!(waiting.blocked_by_task_id.as_deref(), Some(first.id()));
        assert!(waiting.queued_reason.is_some());

        let locks = h.orchestrator.locks();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].owner_task_id, first.id());
        assert!(locks[0].normalized_path.ends_with("shared.rs"));

        let first = h.wait(first.id()).await;
        let second = h.wait(second.id()).await;
        assert_eq!(first.status, TaskStatus::Completed);
        assert_eq!(second.status, TaskStatus::Completed);
        assert!(first.completion_summary.unwrap().contains("Files written:"));

        let statuses = seen.lock().unwrap().clone();
        assert_eq!(statuses.iter().filter(|s| *s == "Queued").count(), 1);
        assert_eq!(statuses.last().map(String::as_str), Some("Completed"));

        // The resumed run was told which file was freed
        let resumed = (1..=h.runs())
            .map(|run| h.prompt(run))
            .find(|p| p.contains("is now available"))
            .expect("a resume prompt was sent");
        assert!(resumed.contains("shared.rs"));
        assert!(h.orchestrator.locks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ignoring_locks_never_queues() {
        let h = setup_harness(CONTENDED);

        let first = h.orchestrator.create_task(h.request("first writer")).unwrap();
        let mut request = h.request("second writer");
        request.flags = TaskFlags { ignore_file_locks: true, ..Default::default() };
        let second = h.orchestrator.create_task(request).unwrap();
        let seen = record_statuses(&h.orchestrator, second.id());

        h.wait(first.id()).await;
        let second = h.wait(second.id()).await;
        assert_eq!(second.status, TaskStatus::Completed);
        assert!(!seen.lock().unwrap().iter().any(|s| s == "Queued"));
    }
}

mod dependency_tests {
    use super::*;

    const ORDERED: &str = r#"case "$prompt" in
  *"first step"*) sleep 0.3; echo first >> "$here/order" ;;
  *"second step"*) echo second >> "$here/order" ;;
esac
result "ok""#;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dependent_task_waits_for_its_dependency() {
        let h = setup_harness(ORDERED);

        let first = h.orchestrator.create_task(h.request("first step")).unwrap();
        let mut request = h.request("second step");
        request.dependency_task_ids = vec![first.id().to_string()];
        let second = h.orchestrator.create_task(request).unwrap();

        assert_eq!(second.status(), TaskStatus::Queued);

        h.wait(first.id()).await;
        let second = h.wait(second.id()).await;
        assert_eq!(second.status, TaskStatus::Completed);
        assert_eq!(read_lines(&h.dir.path().join("order")), vec!["first", "second"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sequential_batch_runs_in_order() {
        let h = setup_harness(ORDERED);

        let handles = h
            .orchestrator
            .create_batch(
                "release",
                vec![h.request("first step"), h.request("second step")],
                true,
            )
            .unwrap();
        assert_eq!(handles.len(), 2);

        let (a, b) = (handles[0].snapshot(), handles[1].snapshot());
        assert_eq!(a.group_id, b.group_id);
        assert_eq!(b.group_name.as_deref(), Some("release"));
        assert_eq!(b.dependency_task_ids, vec![a.id.clone()]);

        for handle in &handles {
            assert_eq!(h.wait(handle.id()).await.status, TaskStatus::Completed);
        }
        assert_eq!(read_lines(&h.dir.path().join("order")), vec!["first", "second"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_dependency_is_rejected() {
        let h = setup_harness(r#"result "ok""#);
        let mut request = h.request("orphan");
        request.dependency_task_ids = vec!["ffffffffffffffff".to_string()];

        let err = h.orchestrator.create_task(request).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownDependency);
        assert!(h.orchestrator.tasks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn added_dependency_cannot_close_a_cycle() {
        let h = setup_harness("sleep 30");

        let a = h.orchestrator.create_task(h.request("a")).unwrap();
        let b = h.orchestrator.create_task(h.request("b")).unwrap();

        h.orchestrator.add_dependency(b.id(), a.id()).unwrap();
        let err = h.orchestrator.add_dependency(a.id(), b.id()).unwrap_err();
        assert_eq!(err.code, ErrorCode::DependencyCycle);

        let err = h.orchestrator.add_dependency(a.id(), "ffffffffffffffff").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownDependency);

        h.orchestrator.cancel(a.id()).unwrap();
        h.orchestrator.cancel(b.id()).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subtask_inherits_the_parent_project() {
        let h = setup_harness(r#"result "ok""#);

        let parent = h.orchestrator.create_task(h.request("parent")).unwrap();
        let child = h
            .orchestrator
            .create_subtask(parent.id(), TaskRequest::new("child", ""))
            .unwrap();

        let child = h.wait(child.id()).await;
        let parent = h.wait(parent.id()).await;
        assert_eq!(child.project_path, parent.project_path);
        assert_eq!(child.parent_task_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(parent.child_task_ids, vec![child.id.clone()]);
    }
}

mod persistence_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn history_round_trips_through_the_store() {
        let store = setup_store();
        let h = setup_harness_with(r#"result "Fix login bug""#, |_| {}, Some(Arc::clone(&store)));

        let handle = h.orchestrator.create_task(h.request("Fix the login bug")).unwrap();
        let finished = h.wait(handle.id()).await;
        h.orchestrator.save_history().await.unwrap();

        let (_dir, config) = setup_agent(r#"result "unused""#);
        let restored = TaskOrchestrator::new(config, Some(store));
        assert_eq!(restored.restore_history().await.unwrap(), 1);

        let task = restored.task(handle.id()).unwrap().snapshot();
        assert_eq!(task, finished);
        assert_eq!(task.summary.as_deref(), Some("Fix login bug"));
        assert_eq!(task.stored_prompt, None);

        // Restoring twice adds nothing
        assert_eq!(restored.restore_history().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_tasks_are_saved_as_they_finish() {
        let store = setup_store();
        let h = setup_harness_with(r#"result "ok""#, |_| {}, Some(Arc::clone(&store)));

        let first = h.orchestrator.create_task(h.request("first")).unwrap();
        h.wait(first.id()).await;
        let second = h.orchestrator.create_task(h.request("second")).unwrap();
        h.wait(second.id()).await;

        // Saves run in the background
        let mut saved = Vec::new();
        for _ in 0..50 {
            saved = store.load_history(168).await.unwrap();
            if saved.len() == 2 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        let ids: Vec<&str> = saved.iter().map(|t| t.id.as_str()).collect();
        assert!(ids.contains(&first.id()));
        assert!(ids.contains(&second.id()));
        assert!(saved.iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stored_tasks_keep_their_order() {
        let store = setup_store();
        let h = setup_harness_with(r#"result "ok""#, |_| {}, Some(store));

        let project = h.project();
        let tasks: Vec<Task> = ["one", "two", "three"]
            .iter()
            .map(|d| Task::create(d, &project, TaskFlags::default()))
            .collect();
        h.orchestrator.save_stored_tasks(tasks.clone()).await.unwrap();

        let loaded = h.orchestrator.load_stored_tasks().await.unwrap();
        let descriptions: Vec<&str> = loaded.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(descriptions, vec!["one", "two", "three"]);

        let relaunched = h.orchestrator.launch_stored(&loaded[1]).unwrap();
        assert_ne!(relaunched.id(), loaded[1].id);
        let task = h.wait(relaunched.id()).await;
        assert_eq!(task.description, "two");
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stored_tasks_need_a_store() {
        let h = setup_harness(r#"result "ok""#);
        let err = h.orchestrator.save_stored_tasks(Vec::new()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Persistence);
        assert!(h.orchestrator.load_stored_tasks().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clear_finished_drops_only_finished_tasks() {
        let h = setup_harness(r#"case "$prompt" in *slow*) sleep 30 ;; esac
result "ok""#);

        let quick = h.orchestrator.create_task(h.request("quick")).unwrap();
        let slow = h.orchestrator.create_task(h.request("slow")).unwrap();
        h.wait(quick.id()).await;

        assert_eq!(h.orchestrator.clear_finished(), 1);
        let remaining: Vec<String> = h.orchestrator.tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(remaining, vec![slow.id().to_string()]);
        h.orchestrator.cancel(slow.id()).unwrap();
    }
}
