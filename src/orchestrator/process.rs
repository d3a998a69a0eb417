//! Agent process spawning and whole-tree signalling.
//!
//! On Unix every agent is started as the leader of its own process group, so
//! signalling the group reaches the shell, the agent CLI and anything they
//! spawned. On Windows `taskkill /T` walks the tree.

use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Start the launch script as a new process group with piped output.
pub fn spawn_script(script_path: &Path, working_dir: &str) -> std::io::Result<Child> {
    let mut cmd = script_command(script_path);
    if !working_dir.is_empty() && Path::new(working_dir).is_dir() {
        cmd.current_dir(working_dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.spawn()
}

#[cfg(unix)]
fn script_command(script_path: &Path) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg(script_path);
    cmd
}

#[cfg(windows)]
fn script_command(script_path: &Path) -> Command {
    let mut cmd = Command::new("powershell");
    cmd.args(["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"])
        .arg(script_path);
    cmd
}

/// Kill the process and all of its descendants. Safe to call on a pid that
/// has already exited.
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pid, "killed process group"),
        Err(nix::errno::Errno::ESRCH) => debug!(pid, "process group already gone"),
        Err(err) => warn!(pid, error = %err, "failed to kill process group"),
    }
}

#[cfg(windows)]
pub fn kill_process_tree(pid: u32) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let result = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .creation_flags(CREATE_NO_WINDOW)
        .output();
    match result {
        Ok(output) if output.status.success() => debug!(pid, "killed process tree"),
        Ok(output) => debug!(
            pid,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "taskkill reported failure"
        ),
        Err(err) => warn!(pid, error = %err, "failed to run taskkill"),
    }
}

/// Stop (pause) the process tree. Returns `false` where unsupported.
#[cfg(unix)]
pub fn suspend_process_tree(pid: u32) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGSTOP)
}

/// Continue a stopped process tree. Returns `false` where unsupported.
#[cfg(unix)]
pub fn resume_process_tree(pid: u32) -> bool {
    signal_group(pid, nix::sys::signal::Signal::SIGCONT)
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(err) => {
            warn!(pid, ?signal, error = %err, "failed to signal process group");
            false
        }
    }
}

#[cfg(windows)]
pub fn suspend_process_tree(_pid: u32) -> bool {
    false
}

#[cfg(windows)]
pub fn resume_process_tree(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[tokio::test]
    async fn kill_reaches_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        let mut file = std::fs::File::create(&script).unwrap();
        writeln!(file, "sleep 30 &\nsleep 30").unwrap();
        drop(file);

        let mut child = spawn_script(&script, "").unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        kill_process_tree(pid);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("process should exit after kill")
            .unwrap();
        assert!(!status.success());

        // Second kill on a dead group is harmless
        kill_process_tree(pid);
    }
}
