//! Integration tests for riptide-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use riptide_config::{Config, FatalPolicy};
use riptide_config::testing::TestEnvironment;

/// Test config loading from a real config file
#[test]
fn test_load_engine_config_from_file() {
    let env = TestEnvironment::new().unwrap();

    let config_content = r#"
[engine]
buffer_size = 32768
max_events = 512
backlog = 64
worker_threads = 2
fatal_policy = "terminate"
"#;
    let path = env.write_config(config_content).unwrap();

    // Read and parse
    let contents = std::fs::read_to_string(path).unwrap();
    let config: Config = toml::from_str(&contents).unwrap();

    assert_eq!(config.engine.buffer_size, 32768);
    assert_eq!(config.engine.max_events, 512);
    assert_eq!(config.engine.backlog, 64);
    assert_eq!(config.engine.worker_threads, Some(2));
    assert_eq!(config.engine.fatal_policy, FatalPolicy::Terminate);
}

/// Test that an empty file yields pure defaults
#[test]
fn test_empty_config_is_default() {
    let env = TestEnvironment::new().unwrap();
    let path = env.write_config("").unwrap();

    let contents = std::fs::read_to_string(path).unwrap();
    let config: Config = toml::from_str(&contents).unwrap();

    assert_eq!(config.engine.buffer_size, 8192);
    assert_eq!(config.engine.worker_threads, None);
    assert_eq!(config.engine.fatal_policy, FatalPolicy::Continue);
}

/// Unknown policy strings must fail to parse rather than silently default
#[test]
fn test_bad_fatal_policy_rejected() {
    let result: Result<Config, _> = toml::from_str("[engine]\nfatal_policy = \"respawn\"\n");
    assert!(result.is_err());
}

/// Default TOML renders every engine key so users can discover them
#[test]
fn test_default_toml_lists_engine_keys() {
    let rendered = Config::default_toml();
    assert!(rendered.contains("buffer_size"));
    assert!(rendered.contains("max_events"));
    assert!(rendered.contains("backlog"));
    assert!(rendered.contains("fatal_policy"));
}
