//! Cache key fingerprints

use crate::config::CacheKeyConfig;
use sha2::{Digest, Sha256};
use std::path::Path;

const MISSING_MARKER: &[u8] = b"\0missing\0";

/// Compute the cache key for `key` relative to `root`
///
/// The hash covers:
/// - The key prefix
/// - Each lock file's path and content (a missing file hashes as a fixed marker)
/// - The architecture tag
///
/// Rendered as `{prefix}-{arch}-{hash}`.
pub fn fingerprint(root: &Path, key: &CacheKeyConfig, arch: &str) -> String {
    let mut hasher = Sha256::new();

    hasher.update(key.prefix.as_bytes());
    hasher.update([0u8]);

    for file in &key.files {
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        match std::fs::read(root.join(file)) {
            Ok(content) => {
                hasher.update((content.len() as u64).to_le_bytes());
                hasher.update(&content);
            }
            Err(e) => {
                tracing::debug!(file = %file.display(), error = %e, "Lock file unreadable for fingerprint");
                hasher.update(MISSING_MARKER);
            }
        }
    }

    hasher.update(arch.as_bytes());

    let hash = hasher.finalize();
    format!("{}-{}-{}", key.prefix, arch, hex::encode(&hash[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn key(files: &[&str]) -> CacheKeyConfig {
        CacheKeyConfig {
            prefix: "cargo".into(),
            files: files.iter().map(PathBuf::from).collect(),
        }
    }

    #[test]
    fn test_format() {
        let dir = TempDir::new().unwrap();
        let fp = fingerprint(dir.path(), &key(&[]), "x86_64");
        assert!(fp.starts_with("cargo-x86_64-"));
        assert_eq!(fp.len(), "cargo-x86_64-".len() + 32);
    }

    #[test]
    fn test_stable_for_same_content() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), "serde 1.0").unwrap();
        let a = fingerprint(dir.path(), &key(&["Cargo.lock"]), "x86_64");
        let b = fingerprint(dir.path(), &key(&["Cargo.lock"]), "x86_64");
        assert_eq!(a, b);
    }

    #[test]
    fn test_changes_with_content_and_arch() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), "serde 1.0").unwrap();
        let before = fingerprint(dir.path(), &key(&["Cargo.lock"]), "x86_64");
        let other_arch = fingerprint(dir.path(), &key(&["Cargo.lock"]), "aarch64");

        std::fs::write(dir.path().join("Cargo.lock"), "serde 1.1").unwrap();
        let after = fingerprint(dir.path(), &key(&["Cargo.lock"]), "x86_64");

        assert_ne!(before, after);
        assert_ne!(before, other_arch);
    }

    #[test]
    fn test_missing_file_differs_from_empty_file() {
        let dir = TempDir::new().unwrap();
        let missing = fingerprint(dir.path(), &key(&["Cargo.lock"]), "x86_64");
        std::fs::write(dir.path().join("Cargo.lock"), "").unwrap();
        let empty = fingerprint(dir.path(), &key(&["Cargo.lock"]), "x86_64");
        assert_ne!(missing, empty);
    }
}
