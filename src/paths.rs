// SPF Tool Gateway - Path Resolution
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Single source of truth for gateway path resolution.
// Cached via OnceLock for zero-overhead repeated access.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

static GATEWAY_ROOT_CACHE: OnceLock<PathBuf> = OnceLock::new();

/// Gateway root directory.
///
/// Resolution order:
///   1. SPF_GATEWAY_ROOT environment variable
///   2. HOME env + /.spf-gateway
///   3. Current directory + /.spf-gateway
pub fn gateway_root() -> &'static Path {
    GATEWAY_ROOT_CACHE.get_or_init(|| {
        if let Ok(root) = std::env::var("SPF_GATEWAY_ROOT") {
            if !root.is_empty() {
                return PathBuf::from(root);
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".spf-gateway");
        }
        PathBuf::from(".spf-gateway")
    })
}

/// LMDB environment directory (preferences + customized policies)
pub fn state_dir() -> PathBuf {
    gateway_root().join("state")
}

pub fn config_path() -> PathBuf {
    gateway_root().join("gateway.json")
}

pub fn cmd_log_path() -> PathBuf {
    gateway_root().join("cmd.log")
}

/// Resolve `path` for policy checks.
///
/// Relative paths are joined onto `base`. Existing paths are canonicalized
/// so symlinks cannot sidestep the blacklist; paths that don't exist yet
/// are normalized lexically (`.` and `..` folded, never above root).
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let joined = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        base.join(path)
    };

    if let Ok(canonical) = std::fs::canonicalize(&joined) {
        return canonical;
    }

    // New file: canonicalize the parent if it exists, keep the file name
    let normalized = normalize(&joined);
    if let (Some(parent), Some(name)) = (normalized.parent(), normalized.file_name()) {
        if let Ok(canonical_parent) = std::fs::canonicalize(parent) {
            return canonical_parent.join(name);
        }
    }
    normalized
}

/// Lexical normalization. No filesystem access.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push("/");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(normalize(Path::new("/repo/./src/../.env")), PathBuf::from("/repo/.env"));
        assert_eq!(normalize(Path::new("/repo/../../..")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }

    #[test]
    fn resolve_joins_relative_onto_base() {
        let resolved = resolve_path(Path::new("/nonexistent-spf-base"), "src/../lib.rs");
        assert_eq!(resolved, PathBuf::from("/nonexistent-spf-base/lib.rs"));
    }

    #[test]
    fn resolve_canonicalizes_existing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        let resolved = resolve_path(dir.path(), "new_file.txt");
        assert_eq!(resolved, canonical.join("new_file.txt"));
    }
}
