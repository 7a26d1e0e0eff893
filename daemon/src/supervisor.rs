//! Keep-alive supervisor: runs forever, holds one server child alive, reconnects to an
//! already-listening server after an exec-replacement, and hot-swaps newer `-vN` binaries.
//! The health/upgrade loop classifies every exit into a restart reason.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use common::config::Config;
use common::forward::ports;
use common::process;

use crate::binary;
use crate::client::ServerClient;
use crate::state::{DaemonState, RestartSignals};

pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESTART_DELAY: Duration = Duration::from_secs(3);
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const UPGRADE_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Health probes are held off this long after reconnecting to a freshly exec'd server.
pub const HEALTH_CHECK_PAUSE_DELAY: Duration = Duration::from_secs(30);
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_CONSECUTIVE_FAILURES: u32 = 2;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the health/upgrade loop handed control back to the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ProcessExited,
    PortUnreachable,
    BinaryUpgrade,
    RestartRequested,
    DaemonRestartRequested,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ProcessExited => "process_exited",
            ExitReason::PortUnreachable => "port_unreachable",
            ExitReason::BinaryUpgrade => "binary_upgrade",
            ExitReason::RestartRequested => "restart_requested",
            ExitReason::DaemonRestartRequested => "daemon_restart_requested",
        }
    }
}

/// The supervised server: either a child we spawned, or an existing process we attached to
/// by the pid bound to the server port (after an exec-replacement of the daemon).
enum ServerChild {
    Spawned(tokio::process::Child),
    Attached { pid: u32 },
}

impl ServerChild {
    /// Resolve when the server process is gone.
    async fn wait(&mut self) {
        match self {
            ServerChild::Spawned(c) => {
                let _ = c.wait().await;
            }
            ServerChild::Attached { pid } => loop {
                if !process::process_alive(*pid) {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            },
        }
    }
}

pub struct Supervisor {
    cfg: Config,
    state: Arc<DaemonState>,
    client: ServerClient,
    restart_rx: mpsc::Receiver<()>,
    daemon_restart_rx: mpsc::Receiver<()>,
}

impl Supervisor {
    pub fn new(cfg: Config, state: Arc<DaemonState>, client: ServerClient, signals: RestartSignals) -> Self {
        Self {
            cfg,
            state,
            client,
            restart_rx: signals.restart_rx,
            daemon_restart_rx: signals.daemon_restart_rx,
        }
    }

    /// Main loop. Returns only when a daemon restart was requested; the restart-daemon
    /// endpoint then execs a new daemon image.
    pub async fn run(&mut self) -> Result<()> {
        let port = self.state.server_port;
        loop {
            // A newer sibling binary published since the last round wins before any start.
            let current = self.state.current_binary();
            match binary::find_newer_binary(&current) {
                Ok(Some(newer)) => {
                    tracing::info!("switching to newer binary {}", newer.display());
                    if let Err(e) = binary::make_executable(&newer) {
                        tracing::warn!("marking {} executable: {:#}", newer.display(), e);
                    }
                    self.state.set_current_binary(newer);
                    self.state.set_next_binary(None);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("binary discovery: {:#}", e),
            }

            // A server may already own the port: a child that survived our exec-replacement.
            // Attach to it instead of spawning a duplicate.
            let (child, initial_pause) = if process::tcp_port_reachable(port, PORT_PROBE_TIMEOUT).await {
                match ports::pid_listening_on(&self.cfg, port).await {
                    Some(pid) => {
                        tracing::info!("reconnecting to running server (pid {})", pid);
                        self.state.mark_started(Some(pid));
                        (ServerChild::Attached { pid }, HEALTH_CHECK_PAUSE_DELAY)
                    }
                    None => {
                        tracing::warn!("port {} is busy but its owner is unknown, retrying", port);
                        tokio::time::sleep(RESTART_DELAY).await;
                        continue;
                    }
                }
            } else {
                let child = match self.start_child().await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!("starting server: {:#}", e);
                        tokio::time::sleep(RESTART_DELAY).await;
                        continue;
                    }
                };
                let mut child = ServerChild::Spawned(child);
                if !wait_for_port(port, STARTUP_TIMEOUT).await {
                    tracing::warn!("server did not open port {} within {:?}", port, STARTUP_TIMEOUT);
                    self.force_kill(&mut child).await;
                    self.state.mark_stopped();
                    tokio::time::sleep(RESTART_DELAY).await;
                    continue;
                }
                (child, HEALTH_CHECK_INTERVAL)
            };

            let reason = self.health_loop(child, initial_pause).await;
            tracing::info!("health loop exited: {}", reason.as_str());
            self.state.mark_stopped();
            self.state.bump_restart_count();

            match reason {
                ExitReason::DaemonRestartRequested => return Ok(()),
                ExitReason::BinaryUpgrade | ExitReason::RestartRequested => continue,
                ExitReason::ProcessExited | ExitReason::PortUnreachable => {
                    tokio::time::sleep(RESTART_DELAY).await;
                }
            }
        }
    }

    /// Spawn the server in its own process group, stdout/stderr teed to the console and the
    /// rolling server log, stdin closed so it can never hang on a prompt.
    async fn start_child(&self) -> Result<tokio::process::Child> {
        let binary_path = self.state.current_binary();
        binary::make_executable(&binary_path)?;
        let log = process::open_rolling_log(&self.cfg.server_log_path())?;
        let log_err = log.try_clone().context("cloning log handle")?;

        let mut cmd = tokio::process::Command::new(&binary_path);
        cmd.arg("--port")
            .arg(self.state.server_port.to_string())
            .env("PATH", self.cfg.extended_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = process::spawn_in_own_group(&mut cmd)
            .with_context(|| format!("spawning {}", binary_path.display()))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_tee(stdout, log);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_tee(stderr, log_err);
        }

        tracing::info!(
            "server started: {} (pid {:?})",
            binary_path.display(),
            child.id()
        );
        self.state.mark_started(child.id());
        Ok(child)
    }

    /// Wait on the child, the restart channels, the health ticker, and the upgrade ticker.
    /// The select only picks the event; acting on it happens outside so the child and the
    /// receivers are borrowed one at a time.
    async fn health_loop(&mut self, mut child: ServerChild, initial_pause: Duration) -> ExitReason {
        enum LoopEvent {
            ChildExited,
            RestartRequested,
            DaemonRestartRequested,
            HealthTick,
            UpgradeTick,
        }

        let mut failures = 0u32;
        let start = tokio::time::Instant::now();
        let mut health = tokio::time::interval_at(start + initial_pause, HEALTH_CHECK_INTERVAL);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut upgrade =
            tokio::time::interval_at(start + UPGRADE_CHECK_INTERVAL, UPGRADE_CHECK_INTERVAL);
        upgrade.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.state.set_next_health_check(next_check_at(initial_pause));

        loop {
            let event = tokio::select! {
                _ = child.wait() => LoopEvent::ChildExited,
                Some(()) = self.restart_rx.recv() => LoopEvent::RestartRequested,
                Some(()) = self.daemon_restart_rx.recv() => LoopEvent::DaemonRestartRequested,
                _ = health.tick() => LoopEvent::HealthTick,
                _ = upgrade.tick() => LoopEvent::UpgradeTick,
            };
            match event {
                LoopEvent::ChildExited => {
                    tracing::warn!("server process exited");
                    return ExitReason::ProcessExited;
                }
                LoopEvent::RestartRequested => {
                    self.graceful_stop(&mut child).await;
                    return ExitReason::RestartRequested;
                }
                LoopEvent::DaemonRestartRequested => {
                    self.graceful_stop(&mut child).await;
                    return ExitReason::DaemonRestartRequested;
                }
                LoopEvent::HealthTick => {
                    self.state.set_next_health_check(next_check_at(HEALTH_CHECK_INTERVAL));
                    if self.probe_server().await {
                        failures = 0;
                    } else {
                        failures += 1;
                        tracing::warn!("server health check failed ({} consecutive)", failures);
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            self.force_kill(&mut child).await;
                            return ExitReason::PortUnreachable;
                        }
                    }
                }
                LoopEvent::UpgradeTick => match binary::find_newer_binary(&self.state.current_binary()) {
                    Ok(Some(newer)) => {
                        tracing::info!("newer binary found: {}", newer.display());
                        self.state.set_next_binary(Some(newer));
                        self.graceful_stop(&mut child).await;
                        return ExitReason::BinaryUpgrade;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("upgrade check: {:#}", e),
                },
            }
        }
    }

    /// TCP connect, then GET /ping expecting "pong".
    async fn probe_server(&self) -> bool {
        if !process::tcp_port_reachable(self.state.server_port, PORT_PROBE_TIMEOUT).await {
            return false;
        }
        self.client.ping().await
    }

    /// Ask the server to exit via its authenticated shutdown endpoint, wait up to the
    /// graceful-stop bound, then fall back to killing the process group.
    async fn graceful_stop(&self, child: &mut ServerChild) {
        let asked = match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, self.client.shutdown()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("graceful shutdown call failed: {:#}", e);
                false
            }
            Err(_) => {
                tracing::warn!("graceful shutdown call timed out");
                false
            }
        };
        if asked {
            match child {
                ServerChild::Spawned(c) => {
                    if tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, c.wait()).await.is_ok() {
                        return;
                    }
                    tracing::warn!("server did not exit after shutdown, force-killing");
                }
                ServerChild::Attached { pid } => {
                    let deadline = tokio::time::Instant::now() + GRACEFUL_STOP_TIMEOUT;
                    while tokio::time::Instant::now() < deadline {
                        if !process::process_alive(*pid) {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    tracing::warn!("server did not exit after shutdown, force-killing");
                }
            }
        }
        self.force_kill(child).await;
    }

    async fn force_kill(&self, child: &mut ServerChild) {
        match child {
            ServerChild::Spawned(c) => process::terminate_child_group(c, process::TERM_GRACE).await,
            ServerChild::Attached { pid } => {
                process::terminate_pid_group(*pid, process::TERM_GRACE).await
            }
        }
    }
}

fn next_check_at(delay: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if process::tcp_port_reachable(port, Duration::from_millis(500)).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    false
}

/// Copy child output lines to both the console and the rolling log file. The writer never
/// back-pressures the child: lines are drained as fast as they arrive.
fn spawn_tee(stream: impl AsyncRead + Unpin + Send + 'static, log: std::fs::File) {
    let mut log = tokio::fs::File::from_std(log);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            println!("{}", line);
            let _ = log.write_all(line.as_bytes()).await;
            let _ = log.write_all(b"\n").await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reasons_have_stable_names() {
        assert_eq!(ExitReason::ProcessExited.as_str(), "process_exited");
        assert_eq!(ExitReason::PortUnreachable.as_str(), "port_unreachable");
        assert_eq!(ExitReason::BinaryUpgrade.as_str(), "binary_upgrade");
        assert_eq!(ExitReason::RestartRequested.as_str(), "restart_requested");
        assert_eq!(ExitReason::DaemonRestartRequested.as_str(), "daemon_restart_requested");
    }

    #[tokio::test]
    async fn wait_for_port_times_out_on_dead_port() {
        assert!(!wait_for_port(1, Duration::from_millis(600)).await);
    }
}
