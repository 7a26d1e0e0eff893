//! Global config singleton. Load ~/.ai-critic/settings.json once; server and daemon both call
//! `ensure_loaded()` so the first caller does the work, later callers get the same instance.
//! Also owns the data-dir layout (configs, logs, credentials) and the extended PATH used to
//! resolve external binaries (cloudflared, npx, lsof) from non-shell environments.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default port the managed server listens on.
pub const DEFAULT_SERVER_PORT: u16 = 23712;
/// Default port the keep-alive daemon's management API listens on.
pub const DEFAULT_DAEMON_PORT: u16 = 23713;

/// Cookie name carrying the server auth token (used by the daemon for /api/shutdown etc.).
pub const AUTH_COOKIE_NAME: &str = "ai-critic-token";

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Cached config from settings.json plus data-dir layout.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for all on-disk state: settings.json, tunnel configs, logs, credentials.
    pub data_dir: PathBuf,
    /// Base domain for named cloudflare tunnels (e.g. "example.com"). Required for
    /// the cloudflare_tunnel / cloudflare_owned providers and domain tunnels.
    pub base_domain: Option<String>,
    /// Explicit cloudflare tunnel name. When unset, a name is derived from the domain.
    pub tunnel_name: Option<String>,
    pub server_port: u16,
    pub daemon_port: u16,
    /// Additional directories prepended to PATH when spawning external binaries.
    pub extra_path_dirs: Vec<PathBuf>,
}

/// Ensure config is loaded (idempotent). Loads settings.json on first call; returns the same instance afterwards.
pub fn ensure_loaded() -> &'static Config {
    CONFIG.get_or_init(|| {
        let data_dir = default_data_dir();
        Config::load_from(&data_dir)
    })
}

impl Config {
    /// Load config rooted at the given data dir. Missing or malformed settings.json means defaults.
    pub fn load_from(data_dir: &Path) -> Self {
        let mut cfg = Config::with_data_dir(data_dir.to_path_buf());
        let Ok(data) = std::fs::read_to_string(data_dir.join("settings.json")) else {
            return cfg;
        };
        let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) else {
            return cfg;
        };

        cfg.base_domain = root
            .get("base_domain")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().trim_matches('.').to_string())
            .filter(|s| !s.is_empty());
        cfg.tunnel_name = root
            .get("tunnel")
            .and_then(|t| t.get("name"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(p) = root.get("server_port").and_then(|v| v.as_u64()) {
            if (1..=u16::MAX as u64).contains(&p) {
                cfg.server_port = p as u16;
            }
        }
        if let Some(p) = root.get("daemon_port").and_then(|v| v.as_u64()) {
            if (1..=u16::MAX as u64).contains(&p) {
                cfg.daemon_port = p as u16;
            }
        }
        if let Some(dirs) = root.get("extra_path_dirs").and_then(|v| v.as_array()) {
            for d in dirs.iter().filter_map(|v| v.as_str()) {
                if !d.trim().is_empty() {
                    cfg.extra_path_dirs.push(PathBuf::from(d.trim()));
                }
            }
        }
        cfg
    }

    /// Defaults rooted at the given data dir (no settings.json read).
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            base_domain: None,
            tunnel_name: None,
            server_port: DEFAULT_SERVER_PORT,
            daemon_port: DEFAULT_DAEMON_PORT,
            extra_path_dirs: Vec::new(),
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Effective cloudflared config for a tunnel group (e.g. tunnel-config-core.yml).
    pub fn tunnel_config_path(&self, group: &str) -> PathBuf {
        self.data_dir.join(format!("tunnel-config-{}.yml", group))
    }

    /// Per-group cloudflared process log.
    pub fn tunnel_log_path(&self, group: &str) -> PathBuf {
        self.logs_dir().join(format!("cloudflared-{}.log", group))
    }

    /// User-editable extra hostname→service mappings merged into the core group.
    pub fn extra_mappings_path(&self) -> PathBuf {
        self.data_dir.join("extra-mappings.json")
    }

    /// Per-group extras file. The core group reads the canonical extra-mappings.json;
    /// other groups get their own file so groups never share ingress rules.
    pub fn group_extra_mappings_path(&self, group: &str) -> PathBuf {
        if group == "core" {
            self.extra_mappings_path()
        } else {
            self.data_dir.join(format!("extra-mappings-{}.json", group))
        }
    }

    /// Ports that must never be killed via the local-ports API.
    pub fn protected_ports_path(&self) -> PathBuf {
        self.data_dir.join("port-protection.json")
    }

    /// Registered domain tunnels (domain → local URL).
    pub fn domains_path(&self) -> PathBuf {
        self.data_dir.join("domains.json")
    }

    /// Newline-separated auth tokens; the first non-empty line is used for daemon→server calls.
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("server-credentials")
    }

    /// Managed server's rolling log (the daemon tees the child here and tails it over SSE).
    pub fn server_log_path(&self) -> PathBuf {
        self.logs_dir().join("server.log")
    }

    /// First non-empty token from the credentials file, if any.
    pub fn read_auth_token(&self) -> Option<String> {
        let data = std::fs::read_to_string(self.credentials_path()).ok()?;
        data.lines()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .map(|l| l.to_string())
    }

    /// PATH value for spawned subprocesses: process PATH extended with the fixed directory list
    /// plus any extra_path_dirs from settings. Daemon/GUI launches do not inherit a shell PATH.
    pub fn extended_path(&self) -> String {
        let mut extra: Vec<PathBuf> = vec![
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/opt/homebrew/bin"),
        ];
        if let Some(home) = dirs::home_dir() {
            extra.push(home.join(".local/bin"));
            extra.push(home.join("go/bin"));
            extra.push(home.join(".npm-global/bin"));
        }
        extra.extend(self.extra_path_dirs.iter().cloned());

        let current = std::env::var("PATH").unwrap_or_default();
        let mut parts: Vec<String> = extra
            .into_iter()
            .map(|d| d.to_string_lossy().into_owned())
            .collect();
        if !current.is_empty() {
            parts.push(current);
        }
        parts.join(":")
    }
}

/// Default data dir: ~/.ai-critic (falls back to /tmp/.ai-critic when HOME is unset).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".ai-critic")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_from(dir.path());
        assert_eq!(cfg.server_port, DEFAULT_SERVER_PORT);
        assert_eq!(cfg.daemon_port, DEFAULT_DAEMON_PORT);
        assert!(cfg.base_domain.is_none());
    }

    #[test]
    fn settings_override_ports_and_domain() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.json"),
            r#"{"base_domain": "example.com.", "server_port": 9000, "tunnel": {"name": "mine"}}"#,
        )
        .unwrap();
        let cfg = Config::load_from(dir.path());
        assert_eq!(cfg.base_domain.as_deref(), Some("example.com"));
        assert_eq!(cfg.server_port, 9000);
        assert_eq!(cfg.tunnel_name.as_deref(), Some("mine"));
    }

    #[test]
    fn group_paths_are_distinct() {
        let cfg = Config::with_data_dir(PathBuf::from("/tmp/x"));
        assert_ne!(cfg.tunnel_config_path("core"), cfg.tunnel_config_path("extension"));
        assert_ne!(cfg.tunnel_log_path("core"), cfg.tunnel_log_path("extension"));
    }
}
