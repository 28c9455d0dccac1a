//! Configuration loading.
//!
//! Every key is optional; missing keys fall back to the defaults below.
//!
//! ```toml
//! database_path = "~/.local/share/skillpanel/skillpanel.db"
//!
//! [review]
//! quorum = 3
//! revert_window_hours = 24
//!
//! [ledger]
//! max_plaintext_bytes = 16384
//! append_retries = 3
//! key_retry_attempts = 3
//! key_retry_backoff_ms = 25
//! ```

use crate::error::{Result, ReviewError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Minimum number of reviewer approvals before a proposal is final.
pub const DEFAULT_QUORUM: u32 = 3;

/// Hours a closed assessment may still be reverted.
pub const DEFAULT_REVERT_WINDOW_HOURS: i64 = 24;

/// Longest accepted revert window, one leap year.
pub const MAX_REVERT_WINDOW_HOURS: i64 = 366 * 24;

/// Upper bound on a single justification or comment.
pub const DEFAULT_MAX_PLAINTEXT_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. `~` and `$VARS` are expanded.
    pub database_path: PathBuf,
    pub review: ReviewConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    pub quorum: u32,
    pub revert_window_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub max_plaintext_bytes: usize,
    /// Extra attempts after losing the tail compare-and-swap.
    pub append_retries: u32,
    /// Attempts against the key-management collaborator per call.
    pub key_retry_attempts: u32,
    /// Base delay for exponential backoff between key attempts.
    pub key_retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            review: ReviewConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            quorum: DEFAULT_QUORUM,
            revert_window_hours: DEFAULT_REVERT_WINDOW_HOURS,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_plaintext_bytes: DEFAULT_MAX_PLAINTEXT_BYTES,
            append_retries: 3,
            key_retry_attempts: 3,
            key_retry_backoff_ms: 25,
        }
    }
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReviewError::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    /// Load `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "Config file absent, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)
            .map_err(|e| ReviewError::validation(format!("invalid config: {e}")))?;
        config.database_path = expand_path(&config.database_path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.review.quorum == 0 {
            return Err(ReviewError::validation("review.quorum must be at least 1"));
        }
        if !(1..=MAX_REVERT_WINDOW_HOURS).contains(&self.review.revert_window_hours) {
            return Err(ReviewError::validation(format!(
                "review.revert_window_hours must be between 1 and {MAX_REVERT_WINDOW_HOURS}"
            )));
        }
        if self.ledger.max_plaintext_bytes == 0 {
            return Err(ReviewError::validation(
                "ledger.max_plaintext_bytes must be at least 1",
            ));
        }
        if self.ledger.key_retry_attempts == 0 {
            return Err(ReviewError::validation(
                "ledger.key_retry_attempts must be at least 1",
            ));
        }
        Ok(())
    }

    /// Default config file location for this platform.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "skillpanel")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("skillpanel.toml"))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ReviewError::validation(format!("cannot render config: {e}")))
    }
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "skillpanel")
        .map(|dirs| dirs.data_dir().join("skillpanel.db"))
        .unwrap_or_else(|| PathBuf::from("skillpanel.db"))
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .map_err(|e| ReviewError::validation(format!("cannot expand {raw}: {e}")))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
