//! Configuration for the settings store.
//!
//! Supports:
//! - CLI arguments via clap, flattened into any binary
//! - Environment variable overrides
//! - Sensible defaults for embedding and tests

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::contract::Contract;

/// Storage and runtime settings of a prefbox instance.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Data directory for the SQLite database
    #[arg(short, long, env = "PREFBOX_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Database file name inside the data directory
    #[arg(long, env = "PREFBOX_DATABASE_NAME", default_value = "settings.db")]
    pub database_name: String,

    /// Authority prefix of resource identifiers
    #[arg(long, env = "PREFBOX_AUTHORITY", default_value = "prefbox")]
    pub authority: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Size of the reader connection pool
    #[arg(long, env = "PREFBOX_READER_POOL_SIZE", default_value_t = 10)]
    pub reader_pool_size: u32,

    /// Size of the writer connection pool
    #[arg(long, env = "PREFBOX_WRITER_POOL_SIZE", default_value_t = 4)]
    pub writer_pool_size: u32,

    /// How long SQLite waits for a lock held by another connection
    #[arg(long, env = "PREFBOX_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub busy_timeout_ms: u64,

    /// Longest back-off after a yield while other writers are queued
    #[arg(long, env = "PREFBOX_YIELD_SLEEP_MS", default_value_t = 4000)]
    pub yield_sleep_ms: u64,

    /// How long closing waits for queued writes
    #[arg(long, env = "PREFBOX_SHUTDOWN_TIMEOUT_MS", default_value_t = 1000)]
    pub shutdown_timeout_ms: u64,
}

impl Config {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_name)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn yield_sleep(&self) -> Duration {
        Duration::from_millis(self.yield_sleep_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn contract(&self) -> Contract {
        Contract::new(self.authority.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_name: "settings.db".into(),
            authority: "prefbox".into(),
            log_level: "info".into(),
            reader_pool_size: 10,
            writer_pool_size: 4,
            busy_timeout_ms: 5000,
            yield_sleep_ms: 4000,
            shutdown_timeout_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database_path(), PathBuf::from("./data/settings.db"));
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.contract().authority(), "prefbox");
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "prefbox",
            "--data-dir",
            "/tmp/prefs",
            "--authority",
            "com.example",
            "--writer-pool-size",
            "1",
        ])
        .unwrap();
        assert_eq!(cli.config.data_dir, PathBuf::from("/tmp/prefs"));
        assert_eq!(cli.config.authority, "com.example");
        assert_eq!(cli.config.writer_pool_size, 1);
        assert_eq!(cli.config.yield_sleep_ms, 4000);
    }
}
