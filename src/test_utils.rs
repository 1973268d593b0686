//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and other test helpers.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// This function sets up a test-friendly logger that:
    /// - Only initializes once per test run (using Once)
    /// - Respects RUST_LOG environment variable with sensible defaults
    /// - Uses test writer to avoid interfering with test output
    /// - Gracefully handles multiple initialization attempts
    ///
    /// # Usage
    ///
    /// For manual initialization in specific tests:
    /// ```rust
    /// #[tokio::test]
    /// async fn my_test() {
    ///     crate::test_utils::logging::init();
    ///     // ... test code ...
    /// }
    /// ```
    ///
    /// For automatic initialization in a test module:
    /// ```rust
    /// #[cfg(test)]
    /// mod tests {
    ///     use super::*;
    ///
    ///     // Auto-initialize logging for all tests in this module
    ///     #[cfg(feature = "test-logging")]
    ///     #[ctor::ctor]
    ///     fn init_test_logging() {
    ///         crate::test_utils::logging::init();
    ///     }
    ///
    ///     #[tokio::test]
    ///     async fn my_test() {
    ///         // No manual init needed - logging already set up!
    ///         // ... test code ...
    ///     }
    /// }
    /// ```
    ///
    /// # Environment Variables
    ///
    /// - `RUST_LOG`: Controls log level (default: "debug,tokio=info,notify=info")
    ///
    /// # Examples
    ///
    /// ```bash
    /// # Run tests with default logging
    /// cargo test --features test-logging
    ///
    /// # Run tests with trace-level logging
    /// RUST_LOG=trace cargo test --features test-logging
    ///
    /// # Run tests with specific module logging
    /// RUST_LOG=i18n_status_engine::resource=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Default filter: debug for our crate, info for noisy dependencies
                EnvFilter::new("debug,tokio=info,notify=info")
            });

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer() // Ensures logs don't interfere with test output
                .with_target(true) // Include module paths in logs
                .with_thread_ids(true) // Include thread IDs for async debugging
                .compact() // Use compact format for test readability
                .try_init()
                .ok(); // Ignore errors if already initialized by another test
        });
    }
}

/// Global test logging setup
///
/// This provides a convenient way to set up logging for all tests in the project.
/// Add this to any test module where you want automatic logging initialization.
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Get the worker binary path for integration tests
///
/// Checks the I18N_WORKER_PATH environment variable and falls back to
/// "i18n-status-core" if not set. This allows tests to work both in CI
/// (where the worker is at a pinned location) and local development (where
/// it is in PATH).
#[cfg(all(test, feature = "worker-integration-tests"))]
pub fn get_test_worker_path() -> String {
    std::env::var("I18N_WORKER_PATH").unwrap_or_else(|_| "i18n-status-core".to_string())
}

/// Integration test helpers for building disposable resource trees
#[cfg(test)]
pub mod integration {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Test project with automatic cleanup
    pub struct TestProject {
        _temp_dir: TempDir, // Underscore prefix keeps it alive until drop
        pub root: PathBuf,
    }

    impl TestProject {
        /// Create an empty project root
        pub fn new() -> io::Result<Self> {
            let temp_dir = TempDir::new()?;
            let root = temp_dir.path().to_path_buf();

            Ok(TestProject {
                _temp_dir: temp_dir,
                root,
            })
        }

        /// Project seeded with an i18next tree: `locales/{en,ja}/common.json`
        pub fn with_default_locales() -> io::Result<Self> {
            let project = Self::new()?;
            project.write_resource("locales/en/common.json", r#"{"title": "Hello"}"#)?;
            project.write_resource("locales/ja/common.json", r#"{"title": "こんにちは"}"#)?;
            Ok(project)
        }

        /// Project seeded with a next-intl tree: a root language file plus a
        /// namespace file
        pub fn with_default_messages() -> io::Result<Self> {
            let project = Self::new()?;
            project.write_resource("messages/en.json", r#"{"common": {"title": "Hello"}}"#)?;
            project.write_resource("messages/en/extra.json", r#"{"note": "Extra"}"#)?;
            Ok(project)
        }

        /// Write one file relative to the project root, creating parent
        /// directories as needed. Returns the absolute path.
        pub fn write_resource(&self, relative: &str, content: &str) -> io::Result<PathBuf> {
            let path = self.root.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content)?;
            Ok(path)
        }

        pub fn delete_resource(&self, relative: &str) -> io::Result<()> {
            fs::remove_file(self.root.join(relative))
        }

        /// Get the project root path
        pub fn path(&self) -> &Path {
            &self.root
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_default_locales_tree() {
            let project = TestProject::with_default_locales().unwrap();

            assert!(project.path().join("locales/en/common.json").exists());
            assert!(project.path().join("locales/ja/common.json").exists());
        }

        #[test]
        fn test_default_messages_tree() {
            let project = TestProject::with_default_messages().unwrap();

            assert!(project.path().join("messages/en.json").exists());
            assert!(project.path().join("messages/en/extra.json").exists());
        }

        #[test]
        fn test_write_resource_creates_parents() {
            let project = TestProject::new().unwrap();
            let path = project
                .write_resource("locales/de/deep/nested.json", "{}")
                .unwrap();
            assert!(path.exists());

            project.delete_resource("locales/de/deep/nested.json").unwrap();
            assert!(!path.exists());
        }
    }
}
