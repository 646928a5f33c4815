//! Processor configuration

use crate::block_store::BLOCK_CACHE_DIR_ENV;
use crate::{Error, Result};
use directories::ProjectDirs;
use lightwallet_params::NetworkType;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the wallet database path
pub const WALLET_DB_PATH_ENV: &str = "LIGHTWALLET_WALLET_DB_PATH";

/// Environment variable overriding the batch size
pub const BATCH_SIZE_ENV: &str = "LIGHTWALLET_BATCH_SIZE";

/// Default number of blocks per download/validate/scan cycle
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Default cap on downloaded-but-unconsumed blocks
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 100;

/// Default reorg safety margin
pub const DEFAULT_REWIND_DISTANCE: u64 = 10;

/// Deepest reorg the processor will follow
pub const DEFAULT_MAX_REORG_SIZE: u64 = 100;

/// Retry configuration for the processor's failed actions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts before the run stops with `MaxAttemptsReached`
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Randomize each delay by ±20%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64);
        if self.jitter {
            jitter_duration(capped)
        } else {
            capped
        }
    }
}

fn jitter_duration(duration: Duration) -> Duration {
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis(((millis as f64 * jitter) as u64).max(1))
}

/// Compact block processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Network the wallet lives on
    pub network: NetworkType,
    /// Blocks per download/validate/scan cycle
    pub batch_size: u64,
    /// Maximum downloaded blocks not yet consumed by the pipeline
    pub max_buffer_size: usize,
    /// Retry policy
    pub retry: RetryConfig,
    /// Reorg safety margin, multiplied by consecutive reorgs
    pub rewind_distance: u64,
    /// Upper bound on a single rewind
    pub max_reorg_size: u64,
    /// Block cache location; per-endpoint default when unset
    pub block_cache_path: Option<PathBuf>,
    /// Wallet database location
    pub wallet_db_path: PathBuf,
    /// Fetch full transactions after scanning
    pub enhance_transactions: bool,
    /// Refresh transparent UTXOs after scanning
    pub fetch_utxos: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            network: NetworkType::Mainnet,
            batch_size: DEFAULT_BATCH_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            retry: RetryConfig::default(),
            rewind_distance: DEFAULT_REWIND_DISTANCE,
            max_reorg_size: DEFAULT_MAX_REORG_SIZE,
            block_cache_path: None,
            wallet_db_path: default_data_dir().join("wallet.db"),
            enhance_transactions: true,
            fetch_utxos: true,
        }
    }
}

impl ProcessorConfig {
    /// Defaults for `network`
    pub fn for_network(network: NetworkType) -> Self {
        Self {
            network,
            wallet_db_path: default_data_dir().join(format!("wallet_{}.db", network.name())),
            ..Default::default()
        }
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LIGHTWALLET_*` environment overrides
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(dir) = non_empty_env(BLOCK_CACHE_DIR_ENV) {
            if self.block_cache_path.is_none() {
                self.block_cache_path =
                    Some(PathBuf::from(dir).join(format!("compact_blocks_{}.db", self.network)));
            }
        }
        if let Some(path) = non_empty_env(WALLET_DB_PATH_ENV) {
            self.wallet_db_path = PathBuf::from(path);
        }
        if let Some(batch) = non_empty_env(BATCH_SIZE_ENV) {
            self.batch_size = batch
                .parse()
                .map_err(|_| Error::Config(format!("{} must be a number, got {:?}", BATCH_SIZE_ENV, batch)))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the processor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        if self.max_buffer_size == 0 {
            return Err(Error::Config("max_buffer_size must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be positive".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config("retry.backoff_multiplier must be >= 1".to_string()));
        }
        if self.max_reorg_size == 0 {
            return Err(Error::Config("max_reorg_size must be positive".to_string()));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Platform data directory for wallet files
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("io", "Lightwallet", "LightwalletSync")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(4), Duration::from_millis(800));
        assert_eq!(retry.backoff_for(5), Duration::from_millis(1000));
        assert_eq!(retry.backoff_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let retry = RetryConfig {
            initial_backoff: Duration::from_millis(1000),
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = retry.backoff_for(1);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_load_partial_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"network": "testnet", "batch_size": 25, "retry": {"max_attempts": 3, "initial_backoff": 10}}"#,
        )
        .unwrap();

        let config = ProcessorConfig::load(&path).unwrap();
        assert_eq!(config.network, NetworkType::Testnet);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.max_reorg_size, DEFAULT_MAX_REORG_SIZE);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = ProcessorConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(ProcessorConfig::default().validate().is_ok());
    }
}
