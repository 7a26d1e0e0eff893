//! Port-forward registry: one record per local port, tracking the provider subprocess (or
//! installed ingress mapping), status, a bounded output log, and the public URL. Every
//! mutation publishes the full current list to the event broadcaster.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;

pub mod cloudflare;
pub mod events;
pub mod localtunnel;
pub mod ports;
pub mod provider;

pub use provider::{
    ForwardBackend, ForwardContext, ForwardHandle, ForwardRequest, ProviderKind, StartedForward,
};

use events::Broadcaster;

/// Lines kept at the head and at the tail of each forward's output log.
const LOG_HEAD_LINES: usize = 100;
const LOG_TAIL_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    Connecting,
    Active,
    Error,
    Stopped,
}

/// User-visible snapshot of one forward. Logs are served separately.
#[derive(Debug, Clone, Serialize)]
pub struct PortForward {
    pub local_port: u16,
    pub label: String,
    pub provider: ProviderKind,
    pub status: ForwardStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// POST /api/forwards body.
#[derive(Debug, Clone, Deserialize)]
pub struct AddForward {
    pub local_port: u16,
    #[serde(default)]
    pub label: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub subdomain: Option<String>,
}

/// Bounded ring over child output: keeps the first and last N lines, drops the middle.
pub struct BoundedLog {
    head: Vec<String>,
    tail: std::collections::VecDeque<String>,
    dropped: u64,
}

impl BoundedLog {
    pub fn new() -> Self {
        Self {
            head: Vec::new(),
            tail: std::collections::VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.head.len() < LOG_HEAD_LINES {
            self.head.push(line.to_string());
            return;
        }
        self.tail.push_back(line.to_string());
        if self.tail.len() > LOG_TAIL_LINES {
            self.tail.pop_front();
            self.dropped += 1;
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let mut out = self.head.clone();
        if self.dropped > 0 {
            out.push(format!("… {} lines dropped …", self.dropped));
        }
        out.extend(self.tail.iter().cloned());
        out
    }
}

impl Default for BoundedLog {
    fn default() -> Self {
        Self::new()
    }
}

struct ForwardEntry {
    info: PortForward,
    log: BoundedLog,
    handle: Option<ForwardHandle>,
}

/// Registry of active forwards keyed by local port.
pub struct ForwardRegistry {
    ctx: ForwardContext,
    entries: DashMap<u16, ForwardEntry>,
    broadcaster: Broadcaster,
}

impl ForwardRegistry {
    pub fn new(ctx: ForwardContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            entries: DashMap::new(),
            broadcaster: Broadcaster::new(),
        })
    }

    pub fn context(&self) -> &ForwardContext {
        &self.ctx
    }

    /// Create a forward and start its provider. The record appears as `connecting`
    /// immediately; it flips to `active` once the provider publishes a URL.
    pub async fn add(self: &Arc<Self>, req: AddForward) -> Result<PortForward> {
        self.add_with_backend(req.clone(), req.provider.backend()).await
    }

    async fn add_with_backend(
        self: &Arc<Self>,
        req: AddForward,
        backend: &'static dyn ForwardBackend,
    ) -> Result<PortForward> {
        if req.local_port == 0 {
            bail!("port must be between 1 and 65535");
        }
        match self.entries.entry(req.local_port) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                bail!("port {} is already forwarded", req.local_port)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ForwardEntry {
                    info: PortForward {
                        local_port: req.local_port,
                        label: req.label.clone(),
                        provider: req.provider,
                        status: ForwardStatus::Connecting,
                        public_url: None,
                        error: None,
                        created_at: Utc::now(),
                    },
                    log: BoundedLog::new(),
                    handle: None,
                });
            }
        }
        self.publish();

        let freq = ForwardRequest {
            local_port: req.local_port,
            label: req.label.clone(),
            subdomain: req.subdomain.clone(),
        };
        match backend.start(&self.ctx, &freq).await {
            Ok(StartedForward::Process { mut child }) => {
                let Some(pid) = child.id() else {
                    self.fail(req.local_port, "tunnel process exited immediately");
                    bail!("tunnel process exited immediately");
                };
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                if let Some(mut e) = self.entries.get_mut(&req.local_port) {
                    e.handle = Some(ForwardHandle::Process { pid });
                }
                if let Some(out) = stdout {
                    self.spawn_pump(req.local_port, out, false);
                }
                if let Some(err) = stderr {
                    self.spawn_pump(req.local_port, err, true);
                }
                let reg = Arc::clone(self);
                let port = req.local_port;
                tokio::spawn(async move {
                    let status = child.wait().await.ok();
                    reg.on_exit(port, status.and_then(|s| s.code()));
                });
            }
            Ok(StartedForward::Mapping { group, mapping_id, url }) => {
                if let Some(mut e) = self.entries.get_mut(&req.local_port) {
                    e.handle = Some(ForwardHandle::Mapping { group, mapping_id });
                    e.info.status = ForwardStatus::Active;
                    e.info.public_url = Some(url);
                }
                self.publish();
            }
            Err(e) => {
                self.fail(req.local_port, &format!("{:#}", e));
                return Err(e);
            }
        }
        self.get(req.local_port)
            .context("forward removed while starting")
    }

    /// Stop the provider and drop the record.
    pub async fn remove(self: &Arc<Self>, port: u16) -> Result<PortForward> {
        let Some((_, mut entry)) = self.entries.remove(&port) else {
            bail!("no forward on port {}", port);
        };
        entry.info.status = ForwardStatus::Stopped;
        self.publish();
        if let Some(handle) = entry.handle.take() {
            let backend = entry.info.provider.backend();
            if let Err(e) = backend.stop(&self.ctx, &handle).await {
                tracing::warn!("stopping forward on port {}: {:#}", port, e);
            }
        }
        Ok(entry.info)
    }

    pub fn get(&self, port: u16) -> Option<PortForward> {
        self.entries.get(&port).map(|e| e.info.clone())
    }

    /// Snapshot of all forwards, port-ascending.
    pub fn list(&self) -> Vec<PortForward> {
        let mut out: Vec<_> = self.entries.iter().map(|e| e.info.clone()).collect();
        out.sort_by_key(|f| f.local_port);
        out
    }

    /// Ring-log contents for one forward.
    pub fn logs(&self, port: u16) -> Option<Vec<String>> {
        self.entries.get(&port).map(|e| e.log.lines())
    }

    /// Latest full-list snapshot plus change notifications (SSE source).
    pub fn subscribe(&self) -> watch::Receiver<Bytes> {
        self.broadcaster.subscribe()
    }

    fn spawn_pump(
        self: &Arc<Self>,
        port: u16,
        stream: impl AsyncRead + Unpin + Send + 'static,
        from_stderr: bool,
    ) {
        let reg = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                reg.log_line(port, &line, from_stderr);
            }
        });
    }

    /// Append a child output line; while connecting, scan it for the provider's public URL.
    fn log_line(&self, port: u16, line: &str, from_stderr: bool) {
        let mut became_active = false;
        if let Some(mut e) = self.entries.get_mut(&port) {
            if from_stderr {
                e.log.push(&format!("! {}", line));
            } else {
                e.log.push(line);
            }
            if e.info.status == ForwardStatus::Connecting {
                if let Some(url) = e.info.provider.backend().parse_url(line) {
                    e.info.public_url = Some(url);
                    e.info.status = ForwardStatus::Active;
                    became_active = true;
                }
            }
        }
        if became_active {
            self.publish();
        }
    }

    /// Child exit: a forward that never published a URL becomes an error; an active one
    /// records the exit and leaves the active state too (its subprocess is gone).
    fn on_exit(&self, port: u16, code: Option<i32>) {
        let mut changed = false;
        if let Some(mut e) = self.entries.get_mut(&port) {
            if e.info.status != ForwardStatus::Stopped {
                let exited = match code {
                    Some(c) => format!("tunnel process exited with status {}", c),
                    None => "tunnel process exited".to_string(),
                };
                e.info.error = Some(if e.info.status == ForwardStatus::Active {
                    exited
                } else {
                    format!("{} before publishing a URL", exited)
                });
                e.info.status = ForwardStatus::Error;
                e.handle = None;
                changed = true;
            }
        }
        if changed {
            self.publish();
        }
    }

    fn fail(&self, port: u16, message: &str) {
        if let Some(mut e) = self.entries.get_mut(&port) {
            e.info.status = ForwardStatus::Error;
            e.info.error = Some(message.to_string());
            e.log.push(message);
            e.handle = None;
        }
        self.publish();
    }

    fn publish(&self) {
        match serde_json::to_vec(&self.list()) {
            Ok(json) => self.broadcaster.publish(Bytes::from(json)),
            Err(e) => tracing::warn!("serializing forward snapshot: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tunnel::TunnelGroups;
    use async_trait::async_trait;
    use std::process::Stdio;
    use std::time::Duration;

    fn test_ctx() -> ForwardContext {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::with_data_dir(dir.path().to_path_buf());
        ForwardContext {
            groups: Arc::new(TunnelGroups::new(&cfg)),
            cfg,
        }
    }

    /// Backend that runs a shell line as the tunnel child; URL parsing comes from the
    /// record's declared provider (localtunnel in these tests).
    struct ShellBackend(&'static str);

    #[async_trait]
    impl ForwardBackend for ShellBackend {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Localtunnel
        }
        fn name(&self) -> &'static str {
            "shell"
        }
        fn description(&self) -> &'static str {
            "test"
        }
        async fn available(&self, _ctx: &ForwardContext) -> bool {
            true
        }
        async fn start(&self, ctx: &ForwardContext, _req: &ForwardRequest) -> Result<StartedForward> {
            let mut cmd = crate::process::command(&ctx.cfg, "sh");
            cmd.args(["-c", self.0])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let child = crate::process::spawn_in_own_group(&mut cmd)?;
            Ok(StartedForward::Process { child })
        }
        fn parse_url(&self, line: &str) -> Option<String> {
            super::localtunnel::parse_url_from_line(line)
        }
    }

    async fn wait_for<F: Fn(&PortForward) -> bool>(
        reg: &Arc<ForwardRegistry>,
        port: u16,
        pred: F,
    ) -> PortForward {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(f) = reg.get(port) {
                    if pred(&f) {
                        return f;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    }

    #[test]
    fn bounded_log_keeps_first_and_last() {
        let mut log = BoundedLog::new();
        for i in 0..250 {
            log.push(&format!("line {}", i));
        }
        let lines = log.lines();
        assert_eq!(lines.first().unwrap(), "line 0");
        assert_eq!(lines.last().unwrap(), "line 249");
        assert!(lines.iter().any(|l| l.contains("dropped")));
        // 100 head + marker + 100 tail
        assert_eq!(lines.len(), 201);
    }

    #[tokio::test]
    async fn add_rejects_duplicate_and_zero_port() {
        let reg = ForwardRegistry::new(test_ctx());
        static SLEEPER: ShellBackend = ShellBackend("sleep 30");
        let req = AddForward {
            local_port: 8080,
            label: "app".into(),
            provider: ProviderKind::Localtunnel,
            subdomain: None,
        };
        reg.add_with_backend(req.clone(), &SLEEPER).await.unwrap();
        assert!(reg.add_with_backend(req.clone(), &SLEEPER).await.is_err());
        let mut zero = req.clone();
        zero.local_port = 0;
        assert!(reg.add_with_backend(zero, &SLEEPER).await.is_err());
        reg.remove(8080).await.unwrap();
    }

    #[tokio::test]
    async fn url_line_flips_connecting_to_active() {
        let reg = ForwardRegistry::new(test_ctx());
        static ECHOER: ShellBackend =
            ShellBackend("echo 'your url is: https://abc.loca.lt'; sleep 30");
        let req = AddForward {
            local_port: 3000,
            label: "web".into(),
            provider: ProviderKind::Localtunnel,
            subdomain: None,
        };
        let created = reg.add_with_backend(req, &ECHOER).await.unwrap();
        assert_eq!(created.status, ForwardStatus::Connecting);

        let active = wait_for(&reg, 3000, |f| f.status == ForwardStatus::Active).await;
        assert_eq!(active.public_url.as_deref(), Some("https://abc.loca.lt"));

        // The broadcaster's latest snapshot reflects the active forward.
        let snapshot = reg.subscribe().borrow().clone();
        let parsed: serde_json::Value = serde_json::from_slice(&snapshot).unwrap();
        assert_eq!(parsed[0]["status"], "active");
        assert_eq!(parsed[0]["public_url"], "https://abc.loca.lt");

        reg.remove(3000).await.unwrap();
        assert!(reg.get(3000).is_none());
    }

    #[tokio::test]
    async fn exit_before_url_is_an_error() {
        let reg = ForwardRegistry::new(test_ctx());
        static QUITTER: ShellBackend = ShellBackend("echo starting; exit 3");
        let req = AddForward {
            local_port: 4000,
            label: String::new(),
            provider: ProviderKind::Localtunnel,
            subdomain: None,
        };
        reg.add_with_backend(req, &QUITTER).await.unwrap();
        let failed = wait_for(&reg, 4000, |f| f.status == ForwardStatus::Error).await;
        let msg = failed.error.unwrap();
        assert!(msg.contains("before publishing a URL"), "{}", msg);
    }

    #[tokio::test]
    async fn remove_of_unknown_port_errors() {
        let reg = ForwardRegistry::new(test_ctx());
        assert!(reg.remove(9999).await.is_err());
    }
}
