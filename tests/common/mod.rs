//! Test utilities for prefbox integration tests.
//!
//! Provides:
//! - Temporary database fixtures
//! - Service and facade constructors over the fixture
//! - Bounded waits for background work

use std::time::{Duration, Instant};

use prefbox::{Config, Settings, SettingsService};
use tempfile::TempDir;

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Configuration rooted at the temporary directory
    pub config: Config,
}

impl TestFixture {
    /// Create a new test fixture with a temporary database directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = Config::with_data_dir(temp_dir.path());
        Self { temp_dir, config }
    }

    /// Open a settings service over the fixture database.
    pub fn service(&self) -> SettingsService {
        SettingsService::open(&self.config).expect("failed to open service")
    }

    /// Open a settings facade over the fixture database.
    pub fn settings(&self) -> Settings {
        Settings::open(&self.config).expect("failed to open settings")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for a condition to become true with timeout.
///
/// Returns `true` if the condition was met, `false` if the timeout expired.
pub fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_creates_temp_dir() {
        let fixture = TestFixture::new();
        assert!(fixture.temp_dir.path().exists());
        assert!(fixture.config.database_path().starts_with(fixture.temp_dir.path()));
    }
}
