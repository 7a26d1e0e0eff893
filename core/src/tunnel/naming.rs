//! Tunnel name derivation. Two schemes: the single-host default derived from the bound
//! domain ("ai-agent-<subdomain>"), and the multi-host scheme that packs hostname, IP and
//! a machine digest into cloudflare's 32-char tunnel-name limit.

use std::path::Path;

/// Cloudflare rejects tunnel names longer than this.
const MAX_TUNNEL_NAME: usize = 32;

fn sanitize(component: &str) -> String {
    let mut out: String = component
        .replace(['_', '.'], "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    while out.ends_with('-') {
        out.pop();
    }
    while out.starts_with('-') {
        out.remove(0);
    }
    out
}

/// Default tunnel name for a bound domain: "ai-agent-<subdomain>" where the subdomain is the
/// first dot-segment, underscores turned into dashes, stripped to [A-Za-z0-9-], truncated
/// to 30 chars with trailing dashes removed.
pub fn default_tunnel_name(domain: &str) -> String {
    let sub = domain.split('.').next().unwrap_or("");
    let mut s: String = sub
        .replace('_', "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    s.truncate(30);
    while s.ends_with('-') {
        s.pop();
    }
    format!("ai-agent-{}", s)
}

/// Multi-host tunnel name: "mcc-<hostname>-<ip>-<digest>-<group>", total length ≤32.
/// Hostname and digest share the budget left after the fixed parts, with a floor of
/// 4 chars for the digest (md5 of the machine id).
pub fn multi_host_tunnel_name(hostname: &str, ip: &str, machine_id: &str, group: &str) -> String {
    let host = sanitize(hostname);
    let ip = sanitize(ip);
    let group = sanitize(group);
    let digest = format!("{:x}", md5::compute(machine_id.as_bytes()));

    // "mcc-" + host + "-" + ip + "-" + digest + "-" + group
    let fixed = 4 + 1 + ip.len() + 1 + 1 + group.len();
    let budget = MAX_TUNNEL_NAME.saturating_sub(fixed);
    let digest_len = (budget / 2).clamp(4, digest.len());
    let host_len = budget.saturating_sub(digest_len);

    let host: String = host.chars().take(host_len).collect();
    let host = host.trim_end_matches('-');
    let digest: String = digest.chars().take(digest_len).collect();

    let mut name = format!("mcc-{}-{}-{}-{}", host, ip, digest, group);
    name.truncate(MAX_TUNNEL_NAME);
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// This machine's hostname, sanitized for name building.
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(s) = std::str::from_utf8(&buf[..end]) {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "host".to_string())
}

/// Best-effort local (outbound) IPv4 address; "0-0-0-0"-style fallback when unknown.
pub fn local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let sock = std::net::UdpSocket::bind("0.0.0.0:0")?;
        sock.connect("8.8.8.8:80")?;
        Ok(sock.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "0.0.0.0".to_string())
}

/// Stable per-machine id, persisted under the data dir on first use.
pub fn machine_id(data_dir: &Path) -> String {
    let path = data_dir.join("machine-id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    let _ = std::fs::create_dir_all(data_dir);
    let _ = std::fs::write(&path, &id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_name_uses_first_segment() {
        assert_eq!(default_tunnel_name("foo.example.com"), "ai-agent-foo");
    }

    #[test]
    fn default_name_sanitizes_underscores_and_symbols() {
        assert_eq!(default_tunnel_name("my_app!.example.com"), "ai-agent-my-app");
    }

    #[test]
    fn default_name_truncates_and_trims_dashes() {
        let long = format!("{}.example.com", "a".repeat(29) + "--");
        let name = default_tunnel_name(&long);
        assert!(name.len() <= "ai-agent-".len() + 30);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn multi_host_name_fits_limit() {
        let name = multi_host_tunnel_name(
            "very-long-hostname.corp.internal",
            "192.168.100.200",
            "f47ac10b-58cc-4372-a567-0e02b2c3d479",
            "extension",
        );
        assert!(name.len() <= 32, "{} is {} chars", name, name.len());
        assert!(name.starts_with("mcc-"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn multi_host_digest_keeps_floor() {
        // Long IP and group squeeze the budget; the digest still gets at least 4 chars.
        let name = multi_host_tunnel_name("h", "10.0.0.1", "machine", "core");
        let digest = format!("{:x}", md5::compute("machine".as_bytes()));
        assert!(name.contains(&digest[..4]));
    }

    #[test]
    fn machine_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = machine_id(dir.path());
        let b = machine_id(dir.path());
        assert_eq!(a, b);
    }
}
