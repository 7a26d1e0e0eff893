//! User-editable extra mappings (extra-mappings.json) merged into a group's effective ingress.
//! Server-configured mappings always win on hostname conflict.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One user-supplied hostname→local-service pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraMapping {
    pub domain: String,
    pub local_url: String,
}

/// On-disk document: `{ "mappings": [ { "domain": ..., "local_url": ... } ] }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraMappings {
    #[serde(default)]
    pub mappings: Vec<ExtraMapping>,
}

impl ExtraMappings {
    /// Load from disk. A missing file is an empty set; a malformed file is logged and ignored.
    pub fn load(path: &Path) -> Self {
        let Ok(data) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&data) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("ignoring malformed extra mappings at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(self).context("serializing extra mappings")?;
        std::fs::write(path, data).with_context(|| format!("writing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra-mappings.json");
        let extras = ExtraMappings {
            mappings: vec![
                ExtraMapping {
                    domain: "foo.example.com".into(),
                    local_url: "http://localhost:8080".into(),
                },
                ExtraMapping {
                    domain: "bar.example.com".into(),
                    local_url: "http://localhost:9090".into(),
                },
            ],
        };
        extras.save(&path).unwrap();
        assert_eq!(ExtraMappings::load(&path), extras);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ExtraMappings::load(&dir.path().join("nope.json")), ExtraMappings::default());
    }

    #[test]
    fn malformed_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra-mappings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(ExtraMappings::load(&path), ExtraMappings::default());
    }
}
