//! Configuration module

use std::env;
use std::path::PathBuf;

/// Pipeline configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file path
    pub database_path: PathBuf,

    /// Directory for archive bundles
    pub archive_dir: PathBuf,

    /// Events older than this are archived and deleted from the store
    pub db_retention_days: i64,

    /// Archive bundles older than this are pruned
    pub archive_retention_days: i64,

    /// Free-space floor on the archive volume; below it the cycle is skipped
    pub min_free_disk_gb: u64,

    /// Interval between retention cycles
    pub archive_interval_secs: u64,

    /// Explanation provider endpoint (empty = fallback-only)
    pub explain_api_url: String,

    /// Timeout budget for one explanation call
    pub explain_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sentinel.db")),

            archive_dir: env::var("ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("archives")),

            db_retention_days: env::var("DB_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),

            archive_retention_days: env::var("ARCHIVE_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),

            min_free_disk_gb: env::var("MIN_FREE_DISK_GB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),

            archive_interval_secs: env::var("ARCHIVE_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),

            explain_api_url: env::var("EXPLAIN_API_URL").unwrap_or_default(),

            explain_timeout_secs: env::var("EXPLAIN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("sentinel.db"),
            archive_dir: PathBuf::from("archives"),
            db_retention_days: 7,
            archive_retention_days: 30,
            min_free_disk_gb: 2,
            archive_interval_secs: 3600,
            explain_api_url: String::new(),
            explain_timeout_secs: 5,
        }
    }
}
