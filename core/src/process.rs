//! Subprocess plumbing shared by the tunnel manager, port-forward providers, and the daemon:
//! spawn children in their own process group, terminate the whole group with a bounded grace
//! period, and append-mode rolling log files for long-lived child output.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::config::Config;

/// Grace period between SIGTERM and SIGKILL when stopping a child group.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// Rotate a rolling log once it grows past this size.
const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Build a command with PATH extended so cloudflared/npx/lsof resolve even when the
/// process was not launched from a shell.
pub fn command(cfg: &Config, program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.env("PATH", cfg.extended_path());
    cmd
}

/// Spawn the command in its own process group so the whole subtree can be killed as one unit.
pub fn spawn_in_own_group(cmd: &mut Command) -> Result<Child> {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn().context("spawning child process")
}

/// Send a signal to the process group led by `pid`. Best-effort.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: i32) {
    unsafe {
        libc::killpg(pid as i32, signal);
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: i32) {}

/// Send a signal to a single process (not its group). Returns whether the signal was delivered.
#[cfg(unix)]
pub fn signal_pid(pid: u32, signal: i32) -> bool {
    unsafe { libc::kill(pid as i32, signal) == 0 }
}

#[cfg(not(unix))]
pub fn signal_pid(_pid: u32, _signal: i32) -> bool {
    false
}

/// Whether a process with this pid still exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// SIGTERM the child's process group, wait up to `grace` for exit, then SIGKILL the group.
/// Reaps the child; never waits unbounded.
pub async fn terminate_child_group(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    #[cfg(unix)]
    signal_group(pid, libc::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    #[cfg(unix)]
    signal_group(pid, libc::SIGKILL);
    let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
}

/// SIGTERM then SIGKILL a process group we do not own a `Child` for (e.g. a reconnected pid).
/// Polls liveness during the grace period instead of waiting on the handle.
pub async fn terminate_pid_group(pid: u32, grace: Duration) {
    #[cfg(unix)]
    signal_group(pid, libc::SIGTERM);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    #[cfg(unix)]
    signal_group(pid, libc::SIGKILL);
}

/// Best-effort `pkill -f <pattern>` for stragglers that escaped their process group.
pub async fn pkill_pattern(cfg: &Config, pattern: &str) {
    let _ = command(cfg, "pkill")
        .args(["-f", pattern])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

/// Open an append-mode log file, creating parent dirs and rotating to `<name>.old`
/// once the file exceeds the size cap.
pub fn open_rolling_log(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log dir {}", parent.display()))?;
    }
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > LOG_ROTATE_BYTES {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".old");
            let _ = std::fs::rename(path, std::path::PathBuf::from(rotated));
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

/// TCP-connect to localhost:port within the timeout. Used for readiness and health checks.
pub async fn tcp_port_reachable(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn rolling_log_creates_parents_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/child.log");
        {
            use std::io::Write;
            let mut f = open_rolling_log(&path).unwrap();
            writeln!(f, "one").unwrap();
        }
        {
            use std::io::Write;
            let mut f = open_rolling_log(&path).unwrap();
            writeln!(f, "two").unwrap();
        }
        let data = std::fs::read_to_string(&path).unwrap();
        assert_eq!(data, "one\ntwo\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_child_group_kills_sleeping_shell() {
        let cfg = Config::with_data_dir(PathBuf::from("/tmp"));
        let mut cmd = command(&cfg, "sh");
        cmd.args(["-c", "sleep 30"]);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let mut child = spawn_in_own_group(&mut cmd).unwrap();
        terminate_child_group(&mut child, Duration::from_secs(2)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn unbound_port_is_unreachable() {
        // Port 1 on localhost is essentially never listening in test environments.
        assert!(!tcp_port_reachable(1, Duration::from_millis(200)).await);
    }
}
