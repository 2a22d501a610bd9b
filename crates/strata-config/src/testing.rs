//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated socket paths
//! - Temporary chunk cache roots
//! - Temporary LMDB metadata directories
//!
//! # Usage
//!
//! ```ignore
//! use strata_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config.storage points into env's temp dir
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, OriginConfig};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Unique socket path for this test
    pub socket_path: PathBuf,
    /// Isolated chunk cache root
    pub cache_root: PathBuf,
    /// Isolated LMDB directory
    pub meta_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let cache_root = root.join("chunks");
        let meta_dir = root.join("meta.lmdb");
        std::fs::create_dir_all(&cache_root)?;
        std::fs::create_dir_all(&meta_dir)?;

        let socket_path = root.join(format!("strata-test-{}.sock", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            socket_path,
            cache_root,
            meta_dir,
            test_id,
        })
    }

    /// Config pointing at this environment.
    ///
    /// Freshness TTL is zero so every request probes the origin, and retries
    /// are kept short so failure tests finish quickly.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.cache_root = self.cache_root.clone();
        cfg.storage.meta_dir = self.meta_dir.clone();
        cfg.daemon.socket = self.socket_path.clone();
        cfg.freshness.ttl_ms = 0;
        cfg.fetch.timeout_ms = 2_000;
        cfg.fetch.retries = 1;
        cfg.fetch.retry_backoff_ms = 1;
        cfg
    }

    /// Config with a set of known roots registered.
    pub fn config_with_roots(&self, roots: &[&str]) -> Config {
        let mut cfg = self.config();
        cfg.origins = roots
            .iter()
            .map(|name| OriginConfig {
                name: name.to_string(),
                url: format!("http://127.0.0.1:0/{}", name),
            })
            .collect();
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.cache_root.exists());
        assert!(env.meta_dir.exists());
    }

    #[test]
    fn test_environment_has_unique_socket() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.socket_path, env2.socket_path);
    }

    #[test]
    fn test_config_points_into_environment() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config_with_roots(&["public", "@lab"]);
        assert_eq!(cfg.storage.cache_root, env.cache_root);
        assert_eq!(cfg.freshness.ttl_ms, 0);
        assert!(cfg.origin_url("@lab").is_some());
    }
}
