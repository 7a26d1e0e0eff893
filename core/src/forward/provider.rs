//! Port-forward providers: a closed set of tagged variants dispatching to a common backend
//! trait, so the registry can manage localtunnel and the cloudflare flavors uniformly.
//! Process providers spawn a long-lived child that prints a public URL; the cloudflare
//! named providers install an ingress mapping on a tunnel group instead.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::cloudflare::{NamedBackend, QuickBackend};
use super::localtunnel::LocaltunnelBackend;
use crate::config::Config;
use crate::process;
use crate::tunnel::{GroupName, TunnelGroups};

/// Port-forward provider: localtunnel, a throwaway cloudflare quick tunnel, or a named
/// cloudflare tunnel (shared or per-machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Localtunnel,
    CloudflareQuick,
    CloudflareTunnel,
    CloudflareOwned,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Localtunnel => "localtunnel",
            ProviderKind::CloudflareQuick => "cloudflare_quick",
            ProviderKind::CloudflareTunnel => "cloudflare_tunnel",
            ProviderKind::CloudflareOwned => "cloudflare_owned",
        }
    }

    /// Strict parse from an API string.
    pub fn from_config(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "localtunnel" => Some(ProviderKind::Localtunnel),
            "cloudflare_quick" => Some(ProviderKind::CloudflareQuick),
            "cloudflare_tunnel" => Some(ProviderKind::CloudflareTunnel),
            "cloudflare_owned" => Some(ProviderKind::CloudflareOwned),
            _ => None,
        }
    }

    pub fn all() -> [ProviderKind; 4] {
        [
            ProviderKind::Localtunnel,
            ProviderKind::CloudflareQuick,
            ProviderKind::CloudflareTunnel,
            ProviderKind::CloudflareOwned,
        ]
    }

    /// Return the backend for this provider (for unified dispatch by the registry).
    pub fn backend(&self) -> &'static dyn ForwardBackend {
        match self {
            ProviderKind::Localtunnel => &LocaltunnelBackend,
            ProviderKind::CloudflareQuick => &QuickBackend,
            ProviderKind::CloudflareTunnel => &NamedBackend { owned: false },
            ProviderKind::CloudflareOwned => &NamedBackend { owned: true },
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared context handed to backends: global config plus the tunnel-group registry the
/// cloudflare named providers install mappings on.
#[derive(Clone)]
pub struct ForwardContext {
    pub cfg: Config,
    pub groups: Arc<TunnelGroups>,
}

/// One start request from the API.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardRequest {
    pub local_port: u16,
    #[serde(default)]
    pub label: String,
    /// Subdomain for the named cloudflare providers; derived from the port when unset.
    #[serde(default)]
    pub subdomain: Option<String>,
}

/// What a backend produced: a child process whose output will be pumped for a URL, or an
/// ingress mapping that is public immediately.
pub enum StartedForward {
    Process { child: tokio::process::Child },
    Mapping { group: GroupName, mapping_id: String, url: String },
}

/// Handle kept by the registry for teardown.
#[derive(Debug, Clone)]
pub enum ForwardHandle {
    Process { pid: u32 },
    Mapping { group: GroupName, mapping_id: String },
}

/// Unified backend trait: same interface for all providers so the registry can manage and
/// dispatch uniformly.
#[async_trait]
pub trait ForwardBackend: Send + Sync {
    fn kind(&self) -> ProviderKind;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Probe whether the provider's external binary is usable.
    async fn available(&self, ctx: &ForwardContext) -> bool;

    /// Launch the forward. Process providers return a child with piped stdout/stderr;
    /// mapping providers return the installed mapping and its public URL.
    async fn start(&self, ctx: &ForwardContext, req: &ForwardRequest) -> Result<StartedForward>;

    /// Scan one line of child output for the provider's canonical public URL.
    fn parse_url(&self, line: &str) -> Option<String>;

    /// Graceful then forceful teardown of whatever `start` produced.
    async fn stop(&self, ctx: &ForwardContext, handle: &ForwardHandle) -> Result<()> {
        match handle {
            ForwardHandle::Process { pid } => {
                process::terminate_pid_group(*pid, process::TERM_GRACE).await;
                Ok(())
            }
            ForwardHandle::Mapping { group, mapping_id } => {
                ctx.groups
                    .group(*group)
                    .manager()
                    .remove_mapping(mapping_id)
                    .await
                    .map(|_| ())
            }
        }
    }
}

/// Introspection row for the provider list API.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: ProviderKind,
    pub name: &'static str,
    pub description: &'static str,
    pub available: bool,
}

/// Describe all providers, probing availability.
pub async fn list_providers(ctx: &ForwardContext) -> Vec<ProviderInfo> {
    let mut out = Vec::new();
    for kind in ProviderKind::all() {
        let backend = kind.backend();
        out.push(ProviderInfo {
            id: kind,
            name: backend.name(),
            description: backend.description(),
            available: backend.available(ctx).await,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_ids_round_trip() {
        for kind in ProviderKind::all() {
            assert_eq!(ProviderKind::from_config(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::from_config("ngrok"), None);
    }

    #[test]
    fn provider_serializes_snake_case() {
        let json = serde_json::to_string(&ProviderKind::CloudflareQuick).unwrap();
        assert_eq!(json, "\"cloudflare_quick\"");
    }
}
