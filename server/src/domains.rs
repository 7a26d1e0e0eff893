//! Domain-tunnel registry: domain→local-URL records persisted to domains.json. Starting a
//! domain ensures the named cloudflare tunnel exists, routes the DNS CNAME, and installs an
//! ingress mapping on the core tunnel group; stopping removes the mapping.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use common::config::Config;
use common::tunnel::{cloudflared, naming, GroupName, IngressMapping, TunnelGroups, TunnelIdentity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub domain: String,
    pub local_url: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DomainsFile {
    #[serde(default)]
    domains: Vec<DomainRecord>,
}

pub struct DomainRegistry {
    path: PathBuf,
    cfg: Config,
    groups: Arc<TunnelGroups>,
    domains: Mutex<Vec<DomainRecord>>,
}

impl DomainRegistry {
    /// Load the registry from the config's domains.json (missing file means empty).
    pub fn load(cfg: &Config, groups: Arc<TunnelGroups>) -> Self {
        let path = cfg.domains_path();
        let domains = std::fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str::<DomainsFile>(&data).ok())
            .map(|f| f.domains)
            .unwrap_or_default();
        Self {
            path,
            cfg: cfg.clone(),
            groups,
            domains: Mutex::new(domains),
        }
    }

    pub async fn list(&self) -> Vec<DomainRecord> {
        self.domains.lock().await.clone()
    }

    /// Add or update a record (does not start the tunnel).
    pub async fn register(&self, domain: &str, local_url: &str) -> Result<DomainRecord> {
        let domain = domain.trim().trim_matches('.').to_lowercase();
        if domain.is_empty() || !domain.contains('.') {
            bail!("invalid domain {:?}", domain);
        }
        let record = DomainRecord {
            domain: domain.clone(),
            local_url: local_url.trim().to_string(),
            enabled: false,
        };
        let mut domains = self.domains.lock().await;
        match domains.iter_mut().find(|d| d.domain == domain) {
            Some(existing) => {
                existing.local_url = record.local_url.clone();
            }
            None => domains.push(record.clone()),
        }
        self.save(&domains)?;
        Ok(record)
    }

    /// Start the tunnel for a registered domain: ensure the named tunnel, bind the core
    /// group to it (first bind wins), route DNS, and install the mapping.
    pub async fn start(&self, domain: &str) -> Result<DomainRecord> {
        let mut domains = self.domains.lock().await;
        let Some(record) = domains.iter_mut().find(|d| d.domain == domain) else {
            bail!("domain {} is not registered", domain);
        };

        let name = self
            .cfg
            .tunnel_name
            .clone()
            .unwrap_or_else(|| naming::default_tunnel_name(&record.domain));
        let tunnel = cloudflared::ensure_tunnel(&self.cfg, &name).await?;
        let group = self.groups.group(GroupName::Core);
        group
            .manager()
            .set_config(TunnelIdentity {
                tunnel_id: tunnel.id.clone(),
                credentials_file: tunnel.credentials_file.clone(),
                name: Some(tunnel.name.clone()),
            })
            .await?;
        cloudflared::route_dns(&self.cfg, &tunnel.id, &record.domain).await?;
        group
            .manager()
            .add_mapping(IngressMapping {
                id: format!("domain:{}", record.domain),
                hostname: record.domain.clone(),
                service: record.local_url.clone(),
                source: format!("domain:{}", record.domain),
            })
            .await?;

        record.enabled = true;
        let updated = record.clone();
        self.save(&domains)?;
        Ok(updated)
    }

    /// Stop the tunnel for a domain: remove its mapping from the core group.
    pub async fn stop(&self, domain: &str) -> Result<DomainRecord> {
        let mut domains = self.domains.lock().await;
        let Some(record) = domains.iter_mut().find(|d| d.domain == domain) else {
            bail!("domain {} is not registered", domain);
        };
        self.groups
            .group(GroupName::Core)
            .manager()
            .remove_mapping(&format!("domain:{}", record.domain))
            .await?;
        record.enabled = false;
        let updated = record.clone();
        self.save(&domains)?;
        Ok(updated)
    }

    fn save(&self, domains: &[DomainRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = DomainsFile { domains: domains.to_vec() };
        let data = serde_json::to_string_pretty(&file).context("serializing domains")?;
        std::fs::write(&self.path, data).with_context(|| format!("writing {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry(dir: &std::path::Path) -> DomainRegistry {
        let cfg = Config::with_data_dir(dir.to_path_buf());
        let groups = Arc::new(TunnelGroups::new(&cfg));
        DomainRegistry::load(&cfg, groups)
    }

    #[tokio::test]
    async fn register_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = test_registry(dir.path());
            reg.register("app.example.com", "http://localhost:3000").await.unwrap();
            reg.register("app.example.com", "http://localhost:4000").await.unwrap();
        }
        let reloaded = test_registry(dir.path());
        let domains = reloaded.list().await;
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].local_url, "http://localhost:4000");
        assert!(!domains[0].enabled);
    }

    #[tokio::test]
    async fn register_rejects_bare_names() {
        let dir = tempfile::tempdir().unwrap();
        let reg = test_registry(dir.path());
        assert!(reg.register("not-a-domain", "http://localhost:1").await.is_err());
    }

    #[tokio::test]
    async fn start_of_unregistered_domain_errors() {
        let dir = tempfile::tempdir().unwrap();
        let reg = test_registry(dir.path());
        assert!(reg.start("ghost.example.com").await.is_err());
    }
}
