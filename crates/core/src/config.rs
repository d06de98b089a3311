//! Tree configuration file parsing (.dirdiff.toml)

use std::path::Path;
use std::time::Duration;

/// Config file name, looked up at the tree root
pub const CONFIG_FILE: &str = ".dirdiff.toml";

/// Per-tree configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DirdiffConfig {
    /// Scan dot-files and dot-directories
    pub include_hidden: bool,

    /// Extra gitignore-style patterns to leave out of snapshots
    pub ignore: Vec<String>,

    /// Hashing threads (defaults to available parallelism)
    pub hash_workers: Option<usize>,

    /// Maximum sync operations in flight at once
    pub transfer_concurrency: usize,

    pub retry: RetryConfig,
}

impl Default for DirdiffConfig {
    fn default() -> Self {
        Self {
            include_hidden: false,
            ignore: Vec::new(),
            hash_workers: None,
            transfer_concurrency: 4,
            retry: RetryConfig::default(),
        }
    }
}

/// Backoff settings for transient transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total tries per operation, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl DirdiffConfig {
    /// Load config from the tree root.
    ///
    /// Returns the default config if .dirdiff.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
