//! Binary version discovery. Publishing a new build means writing `<base>-vN+1` next to the
//! running binary; the supervisor picks the strictly highest N on its next check, ignoring
//! zero-byte files still being written.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

/// Parsed binary file name: base name plus the N of a trailing `-vN` suffix (0 when absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryVersion {
    pub base: String,
    pub version: u64,
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)-v(\d+)$").expect("static regex"))
}

/// Parse a file name into (base, version). Names without a `-vN` suffix are version 0.
pub fn parse_binary_version(file_name: &str) -> BinaryVersion {
    if let Some(caps) = version_re().captures(file_name) {
        if let Ok(version) = caps[2].parse::<u64>() {
            return BinaryVersion {
                base: caps[1].to_string(),
                version,
            };
        }
    }
    BinaryVersion {
        base: file_name.to_string(),
        version: 0,
    }
}

/// Find the highest-versioned sibling of `current` with the same base and a strictly greater
/// version. Zero-byte files are skipped.
pub fn find_newer_binary(current: &Path) -> Result<Option<PathBuf>> {
    let dir = current.parent().context("binary has no parent directory")?;
    let file_name = current
        .file_name()
        .and_then(|n| n.to_str())
        .context("binary has no file name")?;
    let cur = parse_binary_version(file_name);

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
            continue;
        };
        let parsed = parse_binary_version(&name);
        if parsed.base != cur.base || parsed.version <= cur.version {
            continue;
        }
        if best.as_ref().map(|(v, _)| parsed.version > *v).unwrap_or(true) {
            best = Some((parsed.version, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// chmod +x (no-op off unix).
pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_versioned_and_plain_names() {
        assert_eq!(
            parse_binary_version("ai-critic-server-v3"),
            BinaryVersion { base: "ai-critic-server".into(), version: 3 }
        );
        assert_eq!(
            parse_binary_version("ai-critic-server"),
            BinaryVersion { base: "ai-critic-server".into(), version: 0 }
        );
        // "-v" followed by non-digits is part of the base, not a version.
        assert_eq!(
            parse_binary_version("srv-vnext"),
            BinaryVersion { base: "srv-vnext".into(), version: 0 }
        );
    }

    #[test]
    fn picks_strictly_highest_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("srv");
        std::fs::write(&current, b"bin").unwrap();
        std::fs::write(dir.path().join("srv-v1"), b"bin").unwrap();
        std::fs::write(dir.path().join("srv-v3"), b"bin").unwrap();
        std::fs::write(dir.path().join("srv-v2"), b"bin").unwrap();
        let newer = find_newer_binary(&current).unwrap().unwrap();
        assert_eq!(newer, dir.path().join("srv-v3"));
    }

    #[test]
    fn ignores_zero_byte_and_other_bases() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("srv-v2");
        std::fs::write(&current, b"bin").unwrap();
        std::fs::write(dir.path().join("srv-v5"), b"").unwrap(); // still being uploaded
        std::fs::write(dir.path().join("other-v9"), b"bin").unwrap();
        std::fs::write(dir.path().join("srv-v1"), b"bin").unwrap(); // older
        assert_eq!(find_newer_binary(&current).unwrap(), None);

        std::fs::write(dir.path().join("srv-v4"), b"bin").unwrap();
        assert_eq!(
            find_newer_binary(&current).unwrap(),
            Some(dir.path().join("srv-v4"))
        );
    }
}
