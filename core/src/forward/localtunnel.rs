//! Localtunnel provider: spawns `npx localtunnel --port <N>`, parses the public URL from
//! stdout ("your url is: https://xxx.loca.lt"), keeps the process alive until stopped.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::provider::{ForwardBackend, ForwardContext, ForwardRequest, ProviderKind, StartedForward};
use crate::process;

/// Try to extract the public URL from a line of localtunnel stdout
/// (e.g. "your url is: https://xxx.loca.lt").
pub fn parse_url_from_line(line: &str) -> Option<String> {
    let line = line.trim();
    for scheme in ["https://", "http://"] {
        if let Some(idx) = line.find(scheme) {
            let rest = &line[idx..];
            let end = rest
                .find(|c: char| c.is_whitespace())
                .unwrap_or(rest.len());
            let url = rest[..end].trim_end_matches(['.', ',']);
            if url.contains("loca.lt") || url.contains("localtunnel") {
                return Some(url.to_string());
            }
        }
    }
    None
}

pub struct LocaltunnelBackend;

#[async_trait]
impl ForwardBackend for LocaltunnelBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Localtunnel
    }

    fn name(&self) -> &'static str {
        "Localtunnel"
    }

    fn description(&self) -> &'static str {
        "Free public URL via loca.lt (requires Node/npx)"
    }

    async fn available(&self, ctx: &ForwardContext) -> bool {
        process::command(&ctx.cfg, "npx")
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn start(&self, ctx: &ForwardContext, req: &ForwardRequest) -> Result<StartedForward> {
        let mut cmd = process::command(&ctx.cfg, "npx");
        cmd.args(["localtunnel", "--port", &req.local_port.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = process::spawn_in_own_group(&mut cmd)
            .context("spawning localtunnel (is Node/npx installed?)")?;
        Ok(StartedForward::Process { child })
    }

    fn parse_url(&self, line: &str) -> Option<String> {
        parse_url_from_line(line)
    }
}
