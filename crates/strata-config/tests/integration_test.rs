//! Integration tests for strata-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use std::path::PathBuf;
use strata_config::Config;
use tempfile::tempdir;

/// Test config loading from a single file
#[test]
fn test_load_global_config_from_file() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("config.toml");

    let config_content = r#"
[storage]
cache_root = "/custom/chunks"
meta_dir = "/custom/meta"

[fetch]
timeout_ms = 1500
max_concurrent = 4

[[origins]]
name = "public"
url = "http://publisher-a:8080"

[[origins]]
name = "@lab"
url = "http://publisher-b:8080"
"#;
    std::fs::write(&global, config_content).unwrap();

    let config = Config::load_layers(Some(&global), None).unwrap();

    assert_eq!(config.storage.cache_root, PathBuf::from("/custom/chunks"));
    assert_eq!(config.storage.meta_dir, PathBuf::from("/custom/meta"));
    assert_eq!(config.fetch.timeout_ms, 1500);
    assert_eq!(config.fetch.max_concurrent, 4);
    // Unset keys fall back to defaults
    assert_eq!(config.fetch.retries, 2);
    assert_eq!(config.origin_url("@lab"), Some("http://publisher-b:8080"));
}

/// Test config hierarchy: project config overrides global
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();

    let global = temp.path().join("global.toml");
    std::fs::write(
        &global,
        r#"
[freshness]
ttl_ms = 10000
mtime_epsilon_ms = 5

[[origins]]
name = "public"
url = "http://global:8080"
"#,
    )
    .unwrap();

    let project = temp.path().join("project.toml");
    std::fs::write(
        &project,
        r#"
[freshness]
ttl_ms = 0

[[origins]]
name = "public"
url = "http://project:8080"
"#,
    )
    .unwrap();

    let config = Config::load_layers(Some(&global), Some(&project)).unwrap();

    assert_eq!(config.freshness.ttl_ms, 0);
    assert_eq!(config.freshness.mtime_epsilon_ms, 5);
    assert_eq!(config.origins.len(), 1);
    assert_eq!(config.origin_url("public"), Some("http://project:8080"));
}

/// Missing files are skipped, yielding defaults
#[test]
fn test_missing_layers_yield_defaults() {
    let temp = tempdir().unwrap();
    let missing = temp.path().join("nope.toml");

    let config = Config::load_layers(Some(&missing), Some(&missing)).unwrap();
    assert_eq!(config.roots.refresh_interval_secs, 60);
    assert!(config.origins.is_empty());
}

/// Malformed TOML surfaces a parse error
#[test]
fn test_malformed_config_is_error() {
    let temp = tempdir().unwrap();
    let bad = temp.path().join("bad.toml");
    std::fs::write(&bad, "[fetch\nretries = ").unwrap();

    assert!(Config::load_layers(Some(&bad), None).is_err());
}
