//! Tunnel groups: named, isolated aggregations of ingress mappings (`core`, `extension`),
//! each owning one cloudflared process via a unified manager, with a health checker that
//! restarts a mapping's process after sustained probe failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

pub mod cloudflared;
pub mod extra;
pub mod health;
pub mod manager;
pub mod naming;

pub use manager::{ChangeOutcome, IngressMapping, TunnelIdentity, UnifiedTunnelManager};

use crate::config::Config;
use health::{HealthChecker, HealthTarget, MappingRestarter, RestartOnThreshold};

/// The closed set of tunnel groups. Groups do not share ingress rules or subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupName {
    Core,
    Extension,
}

impl GroupName {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupName::Core => "core",
            GroupName::Extension => "extension",
        }
    }

    /// Parse from an API/config string; anything unknown maps to `core`.
    pub fn from_config(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "extension" => GroupName::Extension,
            _ => GroupName::Core,
        }
    }
}

impl std::fmt::Display for GroupName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named tunnel group: the unified manager plus per-mapping health-pause bookkeeping.
/// Lives for the whole process once created.
pub struct TunnelGroup {
    pub name: GroupName,
    manager: UnifiedTunnelManager,
    health_paused_until: DashMap<String, Instant>,
}

impl TunnelGroup {
    fn new(name: GroupName, cfg: &Config) -> Self {
        Self {
            name,
            manager: UnifiedTunnelManager::new(name.as_str(), cfg),
            health_paused_until: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &UnifiedTunnelManager {
        &self.manager
    }

    /// Whether this mapping's probes are currently suppressed.
    pub fn is_mapping_paused(&self, id: &str) -> bool {
        match self.health_paused_until.get(id) {
            Some(until) => *until > Instant::now(),
            None => false,
        }
    }
}

#[async_trait]
impl HealthTarget for TunnelGroup {
    async fn probe_targets(&self) -> Vec<(String, String)> {
        if self.manager.is_paused() {
            return Vec::new();
        }
        let now = Instant::now();
        self.health_paused_until.retain(|_, until| *until > now);
        self.manager
            .list_mappings()
            .await
            .into_iter()
            .filter(|m| !self.is_mapping_paused(&m.id))
            .map(|m| (m.id, m.hostname))
            .collect()
    }
}

#[async_trait]
impl MappingRestarter for TunnelGroup {
    async fn restart_mapping(&self, id: &str) -> Result<()> {
        self.manager.restart_mapping(id).await.map(|_| ())
    }

    fn pause_mapping(&self, id: &str, pause: Duration) {
        self.health_paused_until
            .insert(id.to_string(), Instant::now() + pause);
    }
}

struct GroupEntry {
    group: Arc<TunnelGroup>,
    checker: HealthChecker,
}

/// Registry of tunnel groups, keyed by name. Groups are created lazily on first access and
/// never destroyed within the process. Explicitly constructed so tests own their own registry.
pub struct TunnelGroups {
    cfg: Config,
    groups: DashMap<GroupName, GroupEntry>,
}

impl TunnelGroups {
    pub fn new(cfg: &Config) -> Self {
        Self {
            cfg: cfg.clone(),
            groups: DashMap::new(),
        }
    }

    /// Return the group, creating it (and spawning its health checker) on first access.
    pub fn group(&self, name: GroupName) -> Arc<TunnelGroup> {
        self.groups
            .entry(name)
            .or_insert_with(|| {
                let group = Arc::new(TunnelGroup::new(name, &self.cfg));
                let observer = Arc::new(RestartOnThreshold::new(group.clone()));
                let checker = HealthChecker::spawn(group.clone(), observer);
                GroupEntry { group, checker }
            })
            .group
            .clone()
    }

    /// Stop all health checkers (server shutdown).
    pub fn stop_health_checks(&self) {
        for entry in self.groups.iter() {
            entry.checker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn groups_are_isolated_singletons() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::with_data_dir(dir.path().to_path_buf());
        let groups = TunnelGroups::new(&cfg);
        let core = groups.group(GroupName::Core);
        let core2 = groups.group(GroupName::Core);
        let ext = groups.group(GroupName::Extension);
        assert!(Arc::ptr_eq(&core, &core2));
        assert!(!Arc::ptr_eq(&core, &ext));
        assert_ne!(core.manager().group(), ext.manager().group());
        groups.stop_health_checks();
    }

    #[tokio::test(start_paused = true)]
    async fn paused_mapping_is_excluded_from_probes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::with_data_dir(dir.path().to_path_buf());
        // Built directly (no checker task) so no probe traffic runs under paused time.
        let group = TunnelGroup::new(GroupName::Core, &cfg);
        group
            .manager()
            .add_mapping(IngressMapping {
                id: "a".into(),
                hostname: "x.example.com".into(),
                service: "http://localhost:8080".into(),
                source: "test".into(),
            })
            .await
            .unwrap();

        assert_eq!(group.probe_targets().await.len(), 1);
        group.pause_mapping("a", Duration::from_secs(60));
        assert!(group.probe_targets().await.is_empty());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(group.probe_targets().await.len(), 1);
    }

    #[test]
    fn group_name_round_trips() {
        assert_eq!(GroupName::from_config("extension"), GroupName::Extension);
        assert_eq!(GroupName::from_config("CORE"), GroupName::Core);
        assert_eq!(GroupName::from_config("anything"), GroupName::Core);
        assert_eq!(GroupName::Extension.as_str(), "extension");
    }
}
