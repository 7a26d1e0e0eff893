//! Local listening-port introspection via `lsof -iTCP -sTCP:LISTEN -n -P`, enriched with
//! ppid/cmdline from `ps`. A protected-ports file is consulted before any kill; PID 1 is
//! always protected.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::process;

/// One listening socket as reported by lsof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListeningPort {
    pub port: u16,
    pub pid: u32,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ppid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

/// On-disk protected-ports document: `{ "protected_ports": { "23712": true } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectedPorts {
    #[serde(default)]
    pub protected_ports: HashMap<String, bool>,
}

impl ProtectedPorts {
    pub fn load(path: &Path) -> Self {
        let Ok(data) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&data).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(self).context("serializing protected ports")?;
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
    }

    pub fn is_protected(&self, port: u16) -> bool {
        self.protected_ports
            .get(&port.to_string())
            .copied()
            .unwrap_or(false)
    }
}

/// Parse lsof output into (command, pid, port) rows. Lines whose listen address cannot be
/// read unambiguously are skipped: when in doubt, report no ports rather than wrong ones.
pub fn parse_lsof(output: &str) -> Vec<(String, u32, u16)> {
    let mut out = Vec::new();
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        let command = fields[0].to_string();
        let Ok(pid) = fields[1].parse::<u32>() else {
            continue;
        };
        // NAME is the second-to-last field when the line ends with "(LISTEN)".
        let name = if fields[fields.len() - 1] == "(LISTEN)" {
            fields[fields.len() - 2]
        } else {
            fields[fields.len() - 1]
        };
        let Some(port_str) = name.rsplit(':').next() else {
            continue;
        };
        let Ok(port) = port_str.parse::<u16>() else {
            continue;
        };
        out.push((command, pid, port));
    }
    out
}

/// Parse one `ps -o ppid=,command=` output line into (ppid, cmdline).
pub fn parse_ps(output: &str) -> Option<(u32, String)> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let trimmed = line.trim();
    let (ppid_str, rest) = trimmed.split_once(char::is_whitespace)?;
    let ppid = ppid_str.parse::<u32>().ok()?;
    Some((ppid, rest.trim().to_string()))
}

/// All listening TCP ports on this machine, enriched with parent pid and command line.
/// A missing lsof binary yields a guided install message.
pub async fn list_listening_ports(cfg: &Config) -> Result<Vec<ListeningPort>> {
    let output = match process::command(cfg, "lsof")
        .args(["-iTCP", "-sTCP:LISTEN", "-n", "-P"])
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("lsof not found; install it to list local ports (e.g. `apt install lsof` or `brew install lsof`)");
        }
        Err(e) => return Err(e).context("running lsof"),
    };
    // lsof exits non-zero when nothing matches; treat that as an empty list.
    let rows = parse_lsof(&String::from_utf8_lossy(&output.stdout));

    let mut details: HashMap<u32, (u32, String)> = HashMap::new();
    for &(_, pid, _) in &rows {
        if details.contains_key(&pid) {
            continue;
        }
        if let Ok(ps_out) = process::command(cfg, "ps")
            .args(["-o", "ppid=,command=", "-p", &pid.to_string()])
            .stdin(Stdio::null())
            .output()
            .await
        {
            if let Some(parsed) = parse_ps(&String::from_utf8_lossy(&ps_out.stdout)) {
                details.insert(pid, parsed);
            }
        }
    }

    Ok(rows
        .into_iter()
        .map(|(command, pid, port)| {
            let detail = details.get(&pid);
            ListeningPort {
                port,
                pid,
                command,
                ppid: detail.map(|d| d.0),
                cmdline: detail.map(|d| d.1.clone()),
            }
        })
        .collect())
}

/// First pid listening on the given TCP port, via `lsof -ti`.
pub async fn pid_listening_on(cfg: &Config, port: u16) -> Option<u32> {
    let output = process::command(cfg, "lsof")
        .args(["-ti", &format!("tcp:{}", port), "-sTCP:LISTEN"])
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|l| l.trim().parse::<u32>().ok())
}

/// SIGTERM a process after checking the protected set. Refuses PID 1 and any pid whose
/// listening ports intersect the protected ports. When lsof cannot report ports, the pid's
/// port set is treated as unknown and the kill is allowed.
pub async fn kill_pid(cfg: &Config, pid: u32) -> Result<()> {
    if pid == 1 {
        bail!("refusing to kill PID 1");
    }
    let protected = ProtectedPorts::load(&cfg.protected_ports_path());
    let listening = list_listening_ports(cfg).await.unwrap_or_default();
    for entry in listening.iter().filter(|l| l.pid == pid) {
        if protected.is_protected(entry.port) {
            bail!(
                "refusing to kill pid {}: port {} is protected",
                pid,
                entry.port
            );
        }
    }
    if !process::signal_pid(pid, sigterm()) {
        bail!("failed to signal pid {}", pid);
    }
    Ok(())
}

#[cfg(unix)]
fn sigterm() -> i32 {
    libc::SIGTERM
}

#[cfg(not(unix))]
fn sigterm() -> i32 {
    15
}
