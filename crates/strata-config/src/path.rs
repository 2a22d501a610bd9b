//! Path and key helpers shared by the cache crates.
//!
//! Dataset paths arrive from clients and publishers in slightly different
//! shapes (`a/b`, `/a/b/`, `//a/b`). Everything that keys on a dataset path
//! goes through [`normalize_dataset_path`] first.

use std::path::{Path, PathBuf};

/// Normalize a dataset path: leading `/`, no trailing `/`, no empty segments.
///
/// # Example
/// ```
/// use strata_config::path::normalize_dataset_path;
/// assert_eq!(normalize_dataset_path("runs//2024/"), "/runs/2024");
/// ```
pub fn normalize_dataset_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Stable on-disk key for a dataset: BLAKE3 of `root \0 normalized_path`, hex encoded.
pub fn dataset_key(root: &str, path: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(root.as_bytes());
    hasher.update(&[0]);
    hasher.update(normalize_dataset_path(path).as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(p: impl AsRef<Path>) -> PathBuf {
    let p = p.as_ref();
    if let Ok(stripped) = p.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    p.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_dataset_path() {
        assert_eq!(normalize_dataset_path("a/b"), "/a/b");
        assert_eq!(normalize_dataset_path("/a/b/"), "/a/b");
        assert_eq!(normalize_dataset_path("//a//b"), "/a/b");
        assert_eq!(normalize_dataset_path(""), "/");
    }

    #[test]
    fn test_dataset_key_is_path_insensitive() {
        assert_eq!(dataset_key("r", "a/b"), dataset_key("r", "/a/b/"));
        assert_ne!(dataset_key("r1", "a/b"), dataset_key("r2", "a/b"));
        assert_eq!(dataset_key("r", "x").len(), 64);
    }

    #[test]
    fn test_root_and_path_do_not_collide() {
        // "ab" + "/c" must differ from "a" + "b/c"
        assert_ne!(dataset_key("ab", "c"), dataset_key("a", "b/c"));
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
