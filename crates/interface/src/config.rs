//! Node configuration.
//!
//! One [`SequencerConfig`] value is constructed at startup (usually from a
//! TOML file) and passed down by sub-struct: every component receives only
//! the section it needs. The config is immutable for the life of the
//! process.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Storage location for the node's KV store and census tree directories.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorageConfig {
    /// Base path; the KV store and `cs_*` census directories live under it.
    pub path: PathBuf,
}

/// Batch building and ingestion tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchConfig {
    /// Maximum (and padded) number of ballots per aggregated batch.
    pub batch_size: usize,
    /// A partially filled batch is closed once its oldest ballot has waited
    /// this long.
    pub batch_max_wait_ms: u64,
    /// How often the aggregator scans for work.
    pub aggregator_ticker_interval_ms: u64,
    /// Target pending-queue depth per process; beyond it ingress sheds
    /// load with `Busy`.
    pub ingest_queue_depth: usize,
}

impl BatchConfig {
    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.batch_max_wait_ms)
    }

    pub fn ticker_interval(&self) -> Duration {
        Duration::from_millis(self.aggregator_ticker_interval_ms)
    }
}

/// Worker protocol tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerConfig {
    /// Lease duration; a job whose lease expires is re-queued.
    pub worker_timeout_ms: u64,
    /// How long a banned worker stays banned.
    pub ban_timeout_ms: u64,
    /// Consecutive failures before a worker is banned.
    pub failures_to_get_banned: u32,
    /// Hex-encoded master seed worker tokens are derived from.
    pub master_seed: String,
}

impl WorkerConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn ban_timeout(&self) -> Duration {
        Duration::from_millis(self.ban_timeout_ms)
    }
}

/// Census housekeeping.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CensusConfig {
    /// Working censuses untouched for longer than this are purged.
    pub purge_max_age_ms: u64,
}

impl CensusConfig {
    pub fn purge_max_age(&self) -> Duration {
        Duration::from_millis(self.purge_max_age_ms)
    }
}

/// Chain access tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChainConfig {
    /// How often the process registry is polled for events.
    pub monitor_interval_ms: u64,
    /// RPC endpoints, tried in rotation.
    pub rpc_endpoints: Vec<String>,
    /// Gas estimate multiplier, in percent (120 = +20%).
    pub gas_multiplier_percent: u64,
    /// Consecutive failures before an endpoint is cooled down.
    pub retry_count: u32,
    /// Pause between submission retries.
    pub retry_sleep_ms: u64,
    /// How long a failing endpoint is kept out of rotation.
    pub endpoint_cooldown_ms: u64,
    /// Blocks a write transaction needs before it counts as confirmed.
    pub confirmations: u64,
}

impl ChainConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }

    pub fn endpoint_cooldown(&self) -> Duration {
        Duration::from_millis(self.endpoint_cooldown_ms)
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SequencerConfig {
    pub storage: StorageConfig,
    pub batch: BatchConfig,
    pub workers: WorkerConfig,
    pub census: CensusConfig,
    pub chain: ChainConfig,
}

impl SequencerConfig {
    /// A configuration suitable for tests: tiny batches, fast tickers, a
    /// temp-ish storage path the caller should override.
    pub fn for_testing(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                path: storage_path.into(),
            },
            batch: BatchConfig {
                batch_size: 4,
                batch_max_wait_ms: 50,
                aggregator_ticker_interval_ms: 10,
                ingest_queue_depth: 64,
            },
            workers: WorkerConfig {
                worker_timeout_ms: 30_000,
                ban_timeout_ms: 60_000,
                failures_to_get_banned: 3,
                master_seed: "00".repeat(32),
            },
            census: CensusConfig {
                purge_max_age_ms: 3_600_000,
            },
            chain: ChainConfig {
                monitor_interval_ms: 20,
                rpc_endpoints: vec!["http://localhost:8545".to_string()],
                gas_multiplier_percent: 120,
                retry_count: 3,
                retry_sleep_ms: 10,
                endpoint_cooldown_ms: 1_000,
                confirmations: 1,
            },
        }
    }
}

/// Reads a TOML file as a specific type.
pub fn from_toml_path<P: AsRef<Path>, R: DeserializeOwned>(path: P) -> anyhow::Result<R> {
    let mut contents = String::new();
    {
        let mut file = File::open(path)?;
        file.read_to_string(&mut contents)?;
    }
    tracing::debug!(
        size_in_bytes = contents.len(),
        "Parsing config file"
    );

    let result: R = toml::from_str(&contents)?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn create_config_from(content: &str) -> NamedTempFile {
        let mut config_file = NamedTempFile::new().unwrap();
        config_file.write_all(content.as_bytes()).unwrap();
        config_file
    }

    #[test]
    fn test_correct_config() {
        let config = r#"
            [storage]
            path = "/tmp/scrutiny"
            [batch]
            batch_size = 64
            batch_max_wait_ms = 30000
            aggregator_ticker_interval_ms = 2000
            ingest_queue_depth = 1024
            [workers]
            worker_timeout_ms = 30000
            ban_timeout_ms = 600000
            failures_to_get_banned = 5
            master_seed = "aabbccdd"
            [census]
            purge_max_age_ms = 86400000
            [chain]
            monitor_interval_ms = 5000
            rpc_endpoints = ["http://one:8545", "http://two:8545"]
            gas_multiplier_percent = 130
            retry_count = 3
            retry_sleep_ms = 500
            endpoint_cooldown_ms = 60000
            confirmations = 2
        "#;

        let config_file = create_config_from(config);
        let config: SequencerConfig = from_toml_path(config_file.path()).unwrap();

        assert_eq!(config.batch.batch_size, 64);
        assert_eq!(config.batch.batch_max_wait(), Duration::from_secs(30));
        assert_eq!(config.workers.failures_to_get_banned, 5);
        assert_eq!(config.chain.rpc_endpoints.len(), 2);
        assert_eq!(config.chain.endpoint_cooldown(), Duration::from_secs(60));
        assert_eq!(config.storage.path, PathBuf::from("/tmp/scrutiny"));
    }

    #[test]
    fn missing_section_is_an_error() {
        let config_file = create_config_from("[storage]\npath = \"/tmp\"\n");
        let result: anyhow::Result<SequencerConfig> = from_toml_path(config_file.path());
        assert!(result.is_err());
    }
}
