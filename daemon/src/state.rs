//! Daemon state: a thread-safe snapshot of what the supervisor is doing, plus the
//! capacity-1 restart channels the management API signals through. A failed non-blocking
//! send means a restart is already pending.

use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// JSON snapshot returned by GET /api/keep-alive/status.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub server_pid: Option<u32>,
    pub server_port: u16,
    pub daemon_pid: u32,
    pub current_binary: PathBuf,
    pub daemon_binary: PathBuf,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
    pub next_health_check: Option<DateTime<Utc>>,
    pub next_binary: Option<PathBuf>,
    pub restart_count: u64,
}

struct Inner {
    running: bool,
    server_pid: Option<u32>,
    current_binary: PathBuf,
    started_at: Option<DateTime<Utc>>,
    next_health_check: Option<DateTime<Utc>>,
    next_binary: Option<PathBuf>,
    restart_count: u64,
}

pub struct DaemonState {
    inner: RwLock<Inner>,
    pub server_port: u16,
    pub daemon_binary: PathBuf,
    restart_tx: mpsc::Sender<()>,
    daemon_restart_tx: mpsc::Sender<()>,
}

/// Receiving sides of the restart channels; consumed by the supervisor's health loop.
pub struct RestartSignals {
    pub restart_rx: mpsc::Receiver<()>,
    pub daemon_restart_rx: mpsc::Receiver<()>,
}

impl DaemonState {
    pub fn new(
        server_binary: PathBuf,
        daemon_binary: PathBuf,
        server_port: u16,
    ) -> (Arc<Self>, RestartSignals) {
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (daemon_restart_tx, daemon_restart_rx) = mpsc::channel(1);
        let state = Arc::new(Self {
            inner: RwLock::new(Inner {
                running: false,
                server_pid: None,
                current_binary: server_binary,
                started_at: None,
                next_health_check: None,
                next_binary: None,
                restart_count: 0,
            }),
            server_port,
            daemon_binary,
            restart_tx,
            daemon_restart_tx,
        });
        (
            state,
            RestartSignals {
                restart_rx,
                daemon_restart_rx,
            },
        )
    }

    /// Request a server restart. Returns false when one is already pending.
    pub fn request_restart(&self) -> bool {
        self.restart_tx.try_send(()).is_ok()
    }

    /// Request a daemon self-restart. Returns false when one is already pending.
    pub fn request_daemon_restart(&self) -> bool {
        self.daemon_restart_tx.try_send(()).is_ok()
    }

    pub fn current_binary(&self) -> PathBuf {
        self.inner.read().expect("state lock").current_binary.clone()
    }

    pub fn set_current_binary(&self, path: PathBuf) {
        self.inner.write().expect("state lock").current_binary = path;
    }

    pub fn set_next_binary(&self, path: Option<PathBuf>) {
        self.inner.write().expect("state lock").next_binary = path;
    }

    pub fn mark_started(&self, pid: Option<u32>) {
        let mut inner = self.inner.write().expect("state lock");
        inner.running = true;
        inner.server_pid = pid;
        inner.started_at = Some(Utc::now());
    }

    pub fn mark_stopped(&self) {
        let mut inner = self.inner.write().expect("state lock");
        inner.running = false;
        inner.server_pid = None;
    }

    pub fn is_running(&self) -> bool {
        self.inner.read().expect("state lock").running
    }

    pub fn set_next_health_check(&self, at: DateTime<Utc>) {
        self.inner.write().expect("state lock").next_health_check = Some(at);
    }

    pub fn bump_restart_count(&self) {
        self.inner.write().expect("state lock").restart_count += 1;
    }

    pub fn status(&self) -> DaemonStatus {
        let inner = self.inner.read().expect("state lock");
        DaemonStatus {
            running: inner.running,
            server_pid: inner.server_pid,
            server_port: self.server_port,
            daemon_pid: std::process::id(),
            current_binary: inner.current_binary.clone(),
            daemon_binary: self.daemon_binary.clone(),
            started_at: inner.started_at,
            uptime_secs: inner.started_at.map(|t| (Utc::now() - t).num_seconds()),
            next_health_check: inner.next_health_check,
            next_binary: inner.next_binary.clone(),
            restart_count: inner.restart_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_request_is_idempotent_while_pending() {
        let (state, mut signals) = DaemonState::new(
            PathBuf::from("/tmp/srv"),
            PathBuf::from("/tmp/daemon"),
            23712,
        );
        assert!(state.request_restart());
        // Second request while the first is unconsumed reports "already pending".
        assert!(!state.request_restart());
        signals.restart_rx.try_recv().unwrap();
        assert!(state.request_restart());
    }

    #[test]
    fn status_reflects_lifecycle() {
        let (state, _signals) = DaemonState::new(
            PathBuf::from("/tmp/srv"),
            PathBuf::from("/tmp/daemon"),
            23712,
        );
        assert!(!state.status().running);
        state.mark_started(Some(4242));
        let st = state.status();
        assert!(st.running);
        assert_eq!(st.server_pid, Some(4242));
        assert!(st.started_at.is_some());
        state.bump_restart_count();
        state.mark_stopped();
        let st = state.status();
        assert!(!st.running);
        assert_eq!(st.restart_count, 1);
        assert_eq!(st.server_pid, None);
    }
}
