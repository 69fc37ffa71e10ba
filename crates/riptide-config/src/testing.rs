//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated config directories
//! - Per-test environment variable sets
//! - One-time tracing initialization for test binaries
//!
//! # Usage
//!
//! ```ignore
//! use riptide_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     env.write_config("[engine]\nbuffer_size = 4096\n").unwrap();
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

static INIT_TRACING: Once = Once::new();

/// Install a tracing subscriber for the current test binary (idempotent).
///
/// Respects `RUST_LOG`; defaults to `warn` to keep test output readable.
pub fn init_test_logging() {
    INIT_TRACING.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .try_init();
    });
}

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Directory holding this test's `.riptide/config.toml`
    pub config_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let config_dir = temp_dir.path().join(".riptide");
        std::fs::create_dir_all(&config_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            config_dir,
            test_id,
        })
    }

    /// Path of this environment's config file
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Write config TOML for this environment
    pub fn write_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.config_path();
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Environment variables equivalent to this environment's overrides
    pub fn engine_env(buffer_size: usize, worker_threads: usize) -> Vec<(String, String)> {
        vec![
            ("RIPTIDE_BUFFER_SIZE".to_string(), buffer_size.to_string()),
            (
                "RIPTIDE_WORKER_THREADS".to_string(),
                worker_threads.to_string(),
            ),
        ]
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
