//! Unified tunnel manager: one cloudflared process per group. The effective ingress is the
//! hostname-sorted union of programmatic mappings and user extras (programmatic wins), and the
//! process is only restarted when the rendered config bytes actually change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::cloudflared;
use super::extra::ExtraMappings;
use crate::config::Config;
use crate::process;

/// Delay before health probing resumes after a process replacement; a fresh cloudflared
/// needs a moment to register its connections at the edge.
const STABILIZE_DELAY: Duration = Duration::from_secs(15);

/// One hostname→local-service rule with a stable id and a provenance tag
/// (e.g. "portforward:8080" or "domain:foo.example.com").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressMapping {
    pub id: String,
    pub hostname: String,
    pub service: String,
    pub source: String,
}

/// The cloudflare tunnel a manager is bound to. First bind wins for the process lifetime.
#[derive(Debug, Clone)]
pub struct TunnelIdentity {
    pub tunnel_id: String,
    pub credentials_file: PathBuf,
    /// Tunnel name, used to re-resolve credentials when the stored file disappears.
    pub name: Option<String>,
}

/// Whether a mutating call actually changed the committed config (and hence the process).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Unchanged,
    Applied,
}

/// One entry of the rendered ingress list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub hostname: String,
    pub service: String,
}

/// Filesystem locations owned by one manager.
#[derive(Debug, Clone)]
pub struct ManagerPaths {
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub extra_mappings_path: PathBuf,
}

struct ManagerState {
    identity: Option<TunnelIdentity>,
    /// Keyed by mapping id.
    mappings: BTreeMap<String, IngressMapping>,
    child: Option<tokio::process::Child>,
    running: bool,
}

/// Aggregates ingress mappings for one tunnel group and supervises its cloudflared process.
/// All mutating operations are linearized by the internal mutex for the full
/// rebuild-and-restart cycle.
pub struct UnifiedTunnelManager {
    group: String,
    cfg: Config,
    paths: ManagerPaths,
    state: Mutex<ManagerState>,
    paused: Arc<AtomicBool>,
    pause_gen: Arc<AtomicU64>,
}

impl UnifiedTunnelManager {
    pub fn new(group: &str, cfg: &Config) -> Self {
        let paths = ManagerPaths {
            config_path: cfg.tunnel_config_path(group),
            log_path: cfg.tunnel_log_path(group),
            extra_mappings_path: cfg.group_extra_mappings_path(group),
        };
        Self::with_paths(group, cfg, paths)
    }

    pub fn with_paths(group: &str, cfg: &Config, paths: ManagerPaths) -> Self {
        Self {
            group: group.to_string(),
            cfg: cfg.clone(),
            paths,
            state: Mutex::new(ManagerState {
                identity: None,
                mappings: BTreeMap::new(),
                child: None,
                running: false,
            }),
            paused: Arc::new(AtomicBool::new(false)),
            pause_gen: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Health checks for this group are suppressed while a process replacement settles.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Bind the manager to a cloudflare tunnel. First call wins; later calls are ignored,
    /// since the whole point is one stable external tunnel identity.
    pub async fn set_config(&self, identity: TunnelIdentity) -> Result<ChangeOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = &state.identity {
            tracing::info!(
                "tunnel group {}: already bound to {}, ignoring new config",
                self.group,
                existing.tunnel_id
            );
            return Ok(ChangeOutcome::Unchanged);
        }
        state.identity = Some(identity);
        self.rebuild_and_restart(&mut state, false).await
    }

    /// Insert-or-replace by mapping id. Re-adding an identical mapping is a no-op;
    /// a new mapping with an existing hostname replaces that hostname's entry.
    pub async fn add_mapping(&self, mapping: IngressMapping) -> Result<ChangeOutcome> {
        validate_mapping(&mapping)?;
        let mut state = self.state.lock().await;
        if state.mappings.get(&mapping.id) == Some(&mapping) {
            return Ok(ChangeOutcome::Unchanged);
        }
        state
            .mappings
            .retain(|id, m| *id == mapping.id || m.hostname != mapping.hostname);
        state.mappings.insert(mapping.id.clone(), mapping);
        self.rebuild_and_restart(&mut state, false).await
    }

    /// Remove by id. Absent ids are a no-op.
    pub async fn remove_mapping(&self, id: &str) -> Result<ChangeOutcome> {
        let mut state = self.state.lock().await;
        if state.mappings.remove(id).is_none() {
            return Ok(ChangeOutcome::Unchanged);
        }
        self.rebuild_and_restart(&mut state, false).await
    }

    /// Force a rebuild+restart with the mapping set unchanged. A single misbehaving
    /// cloudflared connection can only be remediated by replacing the process.
    pub async fn restart_mapping(&self, id: &str) -> Result<ChangeOutcome> {
        let mut state = self.state.lock().await;
        if !state.mappings.contains_key(id) {
            tracing::warn!("tunnel group {}: restart for unknown mapping {}", self.group, id);
            return Ok(ChangeOutcome::Unchanged);
        }
        tracing::info!("tunnel group {}: restarting for mapping {}", self.group, id);
        self.rebuild_and_restart(&mut state, true).await
    }

    /// Snapshot of server-configured mappings, hostname-ascending.
    pub async fn list_mappings(&self) -> Vec<IngressMapping> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state.mappings.values().cloned().collect();
        out.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        out
    }

    /// Snapshot of server-configured plus extra mappings (server wins on hostname),
    /// hostname-ascending.
    pub async fn list_all_mappings(&self) -> Vec<IngressMapping> {
        let state = self.state.lock().await;
        let extras = ExtraMappings::load(&self.paths.extra_mappings_path);
        let mut by_hostname: BTreeMap<String, IngressMapping> = BTreeMap::new();
        for e in &extras.mappings {
            by_hostname.insert(
                e.domain.clone(),
                IngressMapping {
                    id: format!("extra:{}", e.domain),
                    hostname: e.domain.clone(),
                    service: e.local_url.clone(),
                    source: "extra".to_string(),
                },
            );
        }
        for m in state.mappings.values() {
            by_hostname.insert(m.hostname.clone(), m.clone());
        }
        by_hostname.into_values().collect()
    }

    /// Whether a cloudflared child is currently running.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    async fn rebuild_and_restart(
        &self,
        state: &mut ManagerState,
        force: bool,
    ) -> Result<ChangeOutcome> {
        let Some(identity) = state.identity.clone() else {
            tracing::debug!("tunnel group {}: no tunnel bound, config not rebuilt", self.group);
            return Ok(ChangeOutcome::Unchanged);
        };

        let extras = ExtraMappings::load(&self.paths.extra_mappings_path);
        let ingress = effective_ingress(&state.mappings, &extras);
        let existing = std::fs::read_to_string(&self.paths.config_path).unwrap_or_default();

        // An empty effective set means nothing to route: no config file, no process.
        if ingress.is_empty() {
            if existing.trim().is_empty() && state.child.is_none() && !force {
                return Ok(ChangeOutcome::Unchanged);
            }
            self.paused.store(true, Ordering::SeqCst);
            // Bumping the generation invalidates any pending delayed unpause.
            self.pause_gen.fetch_add(1, Ordering::SeqCst);
            self.stop_process(state, &identity.tunnel_id).await;
            let _ = std::fs::remove_file(&self.paths.config_path);
            self.paused.store(false, Ordering::SeqCst);
            return Ok(ChangeOutcome::Applied);
        }

        // Stored credentials may be stale (tunnel recreated elsewhere); fall back to
        // resolving by name.
        let (tunnel_id, credentials_file) = if identity.credentials_file.exists() {
            (identity.tunnel_id.clone(), identity.credentials_file.clone())
        } else if let Some(name) = identity.name.as_deref() {
            match cloudflared::lookup_tunnel(&self.cfg, name).await? {
                Some(t) => (t.id, t.credentials_file),
                None => (identity.tunnel_id.clone(), identity.credentials_file.clone()),
            }
        } else {
            (identity.tunnel_id.clone(), identity.credentials_file.clone())
        };

        let yaml = render_config(&tunnel_id, &credentials_file, &ingress);
        // Identical bytes with a live process means nothing to do. Without a live process the
        // rebuild proceeds so a fresh manager still starts cloudflared for the committed config.
        if !force && state.running && existing.trim() == yaml.trim() {
            return Ok(ChangeOutcome::Unchanged);
        }

        self.paused.store(true, Ordering::SeqCst);
        let generation = self.pause_gen.fetch_add(1, Ordering::SeqCst) + 1;

        match self.replace_process(state, &tunnel_id, &yaml).await {
            Ok(()) => {
                let paused = Arc::clone(&self.paused);
                let pause_gen = Arc::clone(&self.pause_gen);
                tokio::spawn(async move {
                    tokio::time::sleep(STABILIZE_DELAY).await;
                    if pause_gen.load(Ordering::SeqCst) == generation {
                        paused.store(false, Ordering::SeqCst);
                    }
                });
                Ok(ChangeOutcome::Applied)
            }
            Err(e) => {
                state.running = false;
                self.paused.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn stop_process(&self, state: &mut ManagerState, tunnel_id: &str) {
        if let Some(mut child) = state.child.take() {
            process::terminate_child_group(&mut child, process::TERM_GRACE).await;
        }
        state.running = false;
        cloudflared::cleanup_tunnel(&self.cfg, tunnel_id).await;
        cloudflared::kill_stragglers(&self.cfg, tunnel_id).await;
    }

    async fn replace_process(
        &self,
        state: &mut ManagerState,
        tunnel_id: &str,
        yaml: &str,
    ) -> Result<()> {
        self.stop_process(state, tunnel_id).await;

        if let Some(parent) = self.paths.config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&self.paths.config_path, yaml)
            .with_context(|| format!("writing {}", self.paths.config_path.display()))?;

        // A previous server instance may have left a cloudflared running against this file.
        cloudflared::kill_stragglers(&self.cfg, &self.paths.config_path.to_string_lossy()).await;

        let log = process::open_rolling_log(&self.paths.log_path)?;
        let log_err = log.try_clone().context("cloning log handle")?;
        let mut cmd = process::command(&self.cfg, "cloudflared");
        cmd.arg("tunnel")
            .arg("--config")
            .arg(&self.paths.config_path)
            .arg("run")
            .arg(tunnel_id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        let child = process::spawn_in_own_group(&mut cmd)
            .with_context(|| format!("starting cloudflared for group {}", self.group))?;
        tracing::info!(
            "tunnel group {}: cloudflared started (pid {:?})",
            self.group,
            child.id()
        );
        state.child = Some(child);
        state.running = true;
        Ok(())
    }
}

fn validate_mapping(m: &IngressMapping) -> Result<()> {
    if m.id.trim().is_empty() {
        bail!("mapping id must not be empty");
    }
    if m.hostname.trim().is_empty() || m.hostname.contains(char::is_whitespace) {
        bail!("invalid hostname {:?}", m.hostname);
    }
    let parsed = url::Url::parse(&m.service)
        .with_context(|| format!("invalid service URL {:?}", m.service))?;
    match parsed.host_str() {
        Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1") => Ok(()),
        other => bail!("service must target loopback, got host {:?}", other),
    }
}

/// Merge server mappings with extras (server wins on hostname) and sort hostname-ascending.
pub fn effective_ingress(
    mappings: &BTreeMap<String, IngressMapping>,
    extras: &ExtraMappings,
) -> Vec<IngressRule> {
    let mut by_hostname: BTreeMap<String, String> = BTreeMap::new();
    for e in &extras.mappings {
        by_hostname.insert(e.domain.clone(), e.local_url.clone());
    }
    for m in mappings.values() {
        by_hostname.insert(m.hostname.clone(), m.service.clone());
    }
    by_hostname
        .into_iter()
        .map(|(hostname, service)| IngressRule { hostname, service })
        .collect()
}

/// Render the on-disk cloudflared config. The restart decision compares trimmed bytes of this
/// output, so the shape must be deterministic: hostname-ascending rules, one trailing
/// catch-all, no optional fields.
pub fn render_config(tunnel_id: &str, credentials_file: &Path, ingress: &[IngressRule]) -> String {
    let mut out = String::new();
    out.push_str(&format!("tunnel: {}\n", tunnel_id));
    out.push_str(&format!("credentials-file: {}\n", credentials_file.display()));
    out.push_str("ingress:\n");
    for rule in ingress {
        out.push_str(&format!("  - hostname: {}\n", rule.hostname));
        out.push_str(&format!("    service: {}\n", rule.service));
    }
    out.push_str("  - service: http_status:404\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::extra::ExtraMapping;

    fn mapping(id: &str, hostname: &str, service: &str) -> IngressMapping {
        IngressMapping {
            id: id.into(),
            hostname: hostname.into(),
            service: service.into(),
            source: format!("test:{}", id),
        }
    }

    fn test_manager(dir: &Path) -> UnifiedTunnelManager {
        let cfg = Config::with_data_dir(dir.to_path_buf());
        let paths = ManagerPaths {
            config_path: dir.join("tunnel-config-core.yml"),
            log_path: dir.join("logs/cloudflared-core.log"),
            extra_mappings_path: dir.join("extra-mappings.json"),
        };
        UnifiedTunnelManager::with_paths("core", &cfg, paths)
    }

    #[test]
    fn render_matches_expected_shape() {
        let ingress = vec![IngressRule {
            hostname: "x.example.com".into(),
            service: "http://localhost:8080".into(),
        }];
        let yaml = render_config("T", Path::new("C"), &ingress);
        assert_eq!(
            yaml,
            "tunnel: T\ncredentials-file: C\ningress:\n  - hostname: x.example.com\n    service: http://localhost:8080\n  - service: http_status:404\n"
        );
    }

    #[test]
    fn render_is_byte_stable_across_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("1".to_string(), mapping("1", "b.example.com", "http://localhost:1"));
        a.insert("2".to_string(), mapping("2", "a.example.com", "http://localhost:2"));
        let mut b = BTreeMap::new();
        b.insert("2".to_string(), mapping("2", "a.example.com", "http://localhost:2"));
        b.insert("1".to_string(), mapping("1", "b.example.com", "http://localhost:1"));
        let extras = ExtraMappings::default();
        let ya = render_config("T", Path::new("C"), &effective_ingress(&a, &extras));
        let yb = render_config("T", Path::new("C"), &effective_ingress(&b, &extras));
        assert_eq!(ya, yb);
    }

    #[test]
    fn ingress_is_sorted_with_single_catch_all() {
        let mut m = BTreeMap::new();
        m.insert("1".to_string(), mapping("1", "z.example.com", "http://localhost:1"));
        m.insert("2".to_string(), mapping("2", "a.example.com", "http://localhost:2"));
        m.insert("3".to_string(), mapping("3", "m.example.com", "http://localhost:3"));
        let rules = effective_ingress(&m, &ExtraMappings::default());
        let hostnames: Vec<_> = rules.iter().map(|r| r.hostname.as_str()).collect();
        assert_eq!(hostnames, vec!["a.example.com", "m.example.com", "z.example.com"]);
        let yaml = render_config("T", Path::new("C"), &rules);
        assert_eq!(yaml.matches("http_status:404").count(), 1);
        assert!(yaml.trim_end().ends_with("- service: http_status:404"));
    }

    #[test]
    fn programmatic_mapping_wins_over_extra() {
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), mapping("a", "x.example.com", "http://localhost:8080"));
        let extras = ExtraMappings {
            mappings: vec![ExtraMapping {
                domain: "x.example.com".into(),
                local_url: "http://localhost:9999".into(),
            }],
        };
        let rules = effective_ingress(&m, &extras);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].service, "http://localhost:8080");
    }

    #[test]
    fn extras_merge_alongside_mappings() {
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), mapping("a", "x.example.com", "http://localhost:8080"));
        let extras = ExtraMappings {
            mappings: vec![ExtraMapping {
                domain: "y.example.com".into(),
                local_url: "http://localhost:9090".into(),
            }],
        };
        let rules = effective_ingress(&m, &extras);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].hostname, "x.example.com");
        assert_eq!(rules[1].hostname, "y.example.com");
    }

    #[tokio::test]
    async fn identical_re_add_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        let m = mapping("a", "x.example.com", "http://localhost:8080");
        assert_eq!(mgr.add_mapping(m.clone()).await.unwrap(), ChangeOutcome::Unchanged); // no identity bound yet
        assert_eq!(mgr.add_mapping(m).await.unwrap(), ChangeOutcome::Unchanged);
        assert_eq!(mgr.list_mappings().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_of_unknown_id_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        assert_eq!(mgr.remove_mapping("ghost").await.unwrap(), ChangeOutcome::Unchanged);
    }

    #[tokio::test]
    async fn same_hostname_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        mgr.add_mapping(mapping("a", "x.example.com", "http://localhost:1")).await.unwrap();
        mgr.add_mapping(mapping("b", "x.example.com", "http://localhost:2")).await.unwrap();
        let listed = mgr.list_mappings().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "b");
    }

    #[tokio::test]
    async fn list_all_includes_extras_with_server_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = test_manager(dir.path());
        ExtraMappings {
            mappings: vec![
                ExtraMapping {
                    domain: "x.example.com".into(),
                    local_url: "http://localhost:9999".into(),
                },
                ExtraMapping {
                    domain: "z.example.com".into(),
                    local_url: "http://localhost:7777".into(),
                },
            ],
        }
        .save(&dir.path().join("extra-mappings.json"))
        .unwrap();
        mgr.add_mapping(mapping("a", "x.example.com", "http://localhost:8080")).await.unwrap();
        let all = mgr.list_all_mappings().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].service, "http://localhost:8080");
        assert_eq!(all[1].hostname, "z.example.com");
    }

    #[test]
    fn non_loopback_service_is_rejected() {
        let m = mapping("a", "x.example.com", "http://example.com:8080");
        assert!(validate_mapping(&m).is_err());
        let ok = mapping("a", "x.example.com", "http://localhost:8080");
        assert!(validate_mapping(&ok).is_ok());
    }
}
