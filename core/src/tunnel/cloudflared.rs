//! cloudflared CLI plumbing: named-tunnel lookup/create, DNS routing, server-side connection
//! cleanup, and straggler kills. All invocations resolve the binary through the extended PATH.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::config::Config;
use crate::process;

/// A named cloudflare tunnel as resolved from `cloudflared tunnel list`.
#[derive(Debug, Clone)]
pub struct NamedTunnel {
    pub id: String,
    pub name: String,
    pub credentials_file: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TunnelListEntry {
    id: String,
    name: String,
    #[serde(default)]
    deleted: bool,
}

/// Default location cloudflared writes tunnel credentials to.
pub fn default_credentials_path(tunnel_id: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".cloudflared")
        .join(format!("{}.json", tunnel_id))
}

/// Whether the cloudflared binary is usable.
pub async fn available(cfg: &Config) -> bool {
    process::command(cfg, "cloudflared")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Find a tunnel by name via `cloudflared tunnel list --output json`.
pub async fn lookup_tunnel(cfg: &Config, name: &str) -> Result<Option<NamedTunnel>> {
    let output = process::command(cfg, "cloudflared")
        .args(["tunnel", "list", "--output", "json"])
        .stdin(Stdio::null())
        .output()
        .await
        .context("running cloudflared tunnel list")?;
    if !output.status.success() {
        bail!(
            "cloudflared tunnel list failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let entries: Vec<TunnelListEntry> =
        serde_json::from_slice(&output.stdout).context("parsing cloudflared tunnel list output")?;
    Ok(entries
        .into_iter()
        .find(|e| e.name == name && !e.deleted)
        .map(|e| NamedTunnel {
            credentials_file: default_credentials_path(&e.id),
            id: e.id,
            name: e.name,
        }))
}

/// Create a tunnel with the given name and resolve it back from the list
/// (create writes the credentials file under ~/.cloudflared).
pub async fn create_tunnel(cfg: &Config, name: &str) -> Result<NamedTunnel> {
    let output = process::command(cfg, "cloudflared")
        .args(["tunnel", "create", name])
        .stdin(Stdio::null())
        .output()
        .await
        .context("running cloudflared tunnel create")?;
    if !output.status.success() {
        bail!(
            "cloudflared tunnel create {} failed: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    lookup_tunnel(cfg, name)
        .await?
        .with_context(|| format!("tunnel {} not listed after create", name))
}

/// Look up a tunnel by name, creating it if it does not exist.
pub async fn ensure_tunnel(cfg: &Config, name: &str) -> Result<NamedTunnel> {
    if let Some(t) = lookup_tunnel(cfg, name).await? {
        return Ok(t);
    }
    tracing::info!("creating cloudflare tunnel {}", name);
    create_tunnel(cfg, name).await
}

/// Create (or overwrite) the DNS CNAME routing `hostname` to the tunnel.
pub async fn route_dns(cfg: &Config, tunnel_ref: &str, hostname: &str) -> Result<()> {
    let output = process::command(cfg, "cloudflared")
        .args(["tunnel", "route", "dns", "--overwrite-dns", tunnel_ref, hostname])
        .stdin(Stdio::null())
        .output()
        .await
        .context("running cloudflared tunnel route dns")?;
    if !output.status.success() {
        bail!(
            "cloudflared tunnel route dns {} {} failed: {}",
            tunnel_ref,
            hostname,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Release server-side connection state for the tunnel. Non-zero exit is informational:
/// cleanup fails benignly when there is nothing to clean.
pub async fn cleanup_tunnel(cfg: &Config, tunnel_id: &str) {
    match process::command(cfg, "cloudflared")
        .args(["tunnel", "cleanup", tunnel_id])
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) if output.status.success() => {}
        Ok(output) => tracing::info!(
            "cloudflared tunnel cleanup {}: {}",
            tunnel_id,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => tracing::info!("cloudflared tunnel cleanup {}: {}", tunnel_id, e),
    }
}

/// Best-effort kill of cloudflared processes matching the pattern (tunnel uuid or config path)
/// that escaped their process group.
pub async fn kill_stragglers(cfg: &Config, pattern: &str) {
    process::pkill_pattern(cfg, pattern).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_path_is_per_tunnel() {
        let a = default_credentials_path("11111111-2222-3333-4444-555555555555");
        assert!(a.to_string_lossy().ends_with(".cloudflared/11111111-2222-3333-4444-555555555555.json"));
    }

    #[test]
    fn tunnel_list_json_parses() {
        let data = r#"[
            {"id": "aaa", "name": "ai-agent-foo", "created_at": "2026-01-01T00:00:00Z"},
            {"id": "bbb", "name": "gone", "deleted": true}
        ]"#;
        let entries: Vec<TunnelListEntry> = serde_json::from_str(data).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].deleted);
        assert!(entries[1].deleted);
    }
}
