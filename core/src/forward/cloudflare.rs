//! Cloudflare providers. The quick variant spawns a throwaway `cloudflared tunnel --url`
//! child and parses the trycloudflare URL from its output. The named variants spawn nothing:
//! they ensure a named tunnel exists, route a DNS CNAME, and install an ingress mapping on
//! the owning tunnel group, so their URL is stable and known up front.

use std::process::Stdio;
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;

use super::provider::{ForwardBackend, ForwardContext, ForwardRequest, ProviderKind, StartedForward};
use crate::process;
use crate::tunnel::{cloudflared, naming, GroupName, IngressMapping, TunnelIdentity};

fn trycloudflare_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("static regex"))
}

/// Throwaway quick tunnel: `cloudflared tunnel --url http://localhost:<N>`.
pub struct QuickBackend;

#[async_trait]
impl ForwardBackend for QuickBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudflareQuick
    }

    fn name(&self) -> &'static str {
        "Cloudflare quick tunnel"
    }

    fn description(&self) -> &'static str {
        "Random trycloudflare.com URL, no account needed"
    }

    async fn available(&self, ctx: &ForwardContext) -> bool {
        cloudflared::available(&ctx.cfg).await
    }

    async fn start(&self, ctx: &ForwardContext, req: &ForwardRequest) -> Result<StartedForward> {
        let mut cmd = process::command(&ctx.cfg, "cloudflared");
        cmd.args([
            "tunnel",
            "--no-autoupdate",
            "--url",
            &format!("http://localhost:{}", req.local_port),
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
        let child = process::spawn_in_own_group(&mut cmd)
            .context("spawning cloudflared quick tunnel")?;
        Ok(StartedForward::Process { child })
    }

    fn parse_url(&self, line: &str) -> Option<String> {
        trycloudflare_re().find(line).map(|m| m.as_str().to_string())
    }
}

/// Named tunnel: installs `<subdomain>.<base_domain>` on a tunnel group instead of spawning
/// a child. `owned: true` uses this machine's own tunnel on the extension group (multi-host
/// deployments); `owned: false` uses the shared tunnel on the core group.
pub struct NamedBackend {
    pub owned: bool,
}

impl NamedBackend {
    fn group(&self) -> GroupName {
        if self.owned {
            GroupName::Extension
        } else {
            GroupName::Core
        }
    }

    fn tunnel_name(&self, ctx: &ForwardContext, base_domain: &str) -> String {
        if self.owned {
            let machine = naming::machine_id(&ctx.cfg.data_dir);
            naming::multi_host_tunnel_name(
                &naming::local_hostname(),
                &naming::local_ip(),
                &machine,
                self.group().as_str(),
            )
        } else {
            ctx.cfg
                .tunnel_name
                .clone()
                .unwrap_or_else(|| naming::default_tunnel_name(base_domain))
        }
    }
}

/// Subdomain for a forward: explicit request, else sanitized label, else "port-<N>".
fn derive_subdomain(req: &ForwardRequest) -> String {
    if let Some(sub) = req.subdomain.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return sub.to_lowercase();
    }
    let label: String = req
        .label
        .trim()
        .to_lowercase()
        .replace([' ', '_'], "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        format!("port-{}", req.local_port)
    } else {
        label.to_string()
    }
}

#[async_trait]
impl ForwardBackend for NamedBackend {
    fn kind(&self) -> ProviderKind {
        if self.owned {
            ProviderKind::CloudflareOwned
        } else {
            ProviderKind::CloudflareTunnel
        }
    }

    fn name(&self) -> &'static str {
        if self.owned {
            "Cloudflare tunnel (this machine)"
        } else {
            "Cloudflare tunnel"
        }
    }

    fn description(&self) -> &'static str {
        if self.owned {
            "Stable subdomain on your domain via this machine's own named tunnel"
        } else {
            "Stable subdomain on your domain via the shared named tunnel"
        }
    }

    async fn available(&self, ctx: &ForwardContext) -> bool {
        ctx.cfg.base_domain.is_some() && cloudflared::available(&ctx.cfg).await
    }

    async fn start(&self, ctx: &ForwardContext, req: &ForwardRequest) -> Result<StartedForward> {
        let Some(base_domain) = ctx.cfg.base_domain.clone() else {
            bail!("cloudflare named tunnels need base_domain in settings.json");
        };
        let subdomain = derive_subdomain(req);
        let hostname = format!("{}.{}", subdomain, base_domain);
        let group_name = self.group();
        let group = ctx.groups.group(group_name);

        let name = self.tunnel_name(ctx, &base_domain);
        let tunnel = cloudflared::ensure_tunnel(&ctx.cfg, &name).await?;
        // First bind wins; later forwards on the same group reuse the bound tunnel.
        group
            .manager()
            .set_config(TunnelIdentity {
                tunnel_id: tunnel.id.clone(),
                credentials_file: tunnel.credentials_file.clone(),
                name: Some(tunnel.name.clone()),
            })
            .await?;
        cloudflared::route_dns(&ctx.cfg, &tunnel.id, &hostname).await?;

        let mapping_id = format!("portforward:{}", req.local_port);
        group
            .manager()
            .add_mapping(IngressMapping {
                id: mapping_id.clone(),
                hostname: hostname.clone(),
                service: format!("http://localhost:{}", req.local_port),
                source: mapping_id.clone(),
            })
            .await?;

        Ok(StartedForward::Mapping {
            group: group_name,
            mapping_id,
            url: format!("https://{}", hostname),
        })
    }

    fn parse_url(&self, _line: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trycloudflare_url_from_noise() {
        let line = "2026-07-30T12:00:00Z INF +  https://witty-otter-abc123.trycloudflare.com  +";
        assert_eq!(
            QuickBackend.parse_url(line),
            Some("https://witty-otter-abc123.trycloudflare.com".to_string())
        );
        assert_eq!(QuickBackend.parse_url("registered tunnel connection"), None);
    }

    #[test]
    fn subdomain_prefers_explicit_then_label_then_port() {
        let explicit = ForwardRequest {
            local_port: 8080,
            label: "My App".into(),
            subdomain: Some("api".into()),
        };
        assert_eq!(derive_subdomain(&explicit), "api");

        let labeled = ForwardRequest {
            local_port: 8080,
            label: "My App_v2".into(),
            subdomain: None,
        };
        assert_eq!(derive_subdomain(&labeled), "my-app-v2");

        let bare = ForwardRequest {
            local_port: 8080,
            label: "!!!".into(),
            subdomain: None,
        };
        assert_eq!(derive_subdomain(&bare), "port-8080");
    }
}
