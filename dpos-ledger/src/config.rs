//! Configuration for the ledger core
//!
//! Every component takes its constants from here through its constructor;
//! nothing reads configuration through a global.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Chain constants
    pub chain: ChainConfig,

    /// Block reward schedule
    pub rewards: RewardConfig,

    /// Sequencer tuning
    pub sequencer: SequencerConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Historical round corrections
    pub exceptions: ExceptionsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "dpos-ledger".to_string(),
            chain: ChainConfig::default(),
            rewards: RewardConfig::default(),
            sequencer: SequencerConfig::default(),
            storage: StorageConfig::default(),
            exceptions: ExceptionsConfig::default(),
        }
    }
}

/// Consensus constants shared by every node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Epoch all slot arithmetic is anchored to
    pub epoch_time: DateTime<Utc>,

    /// Slot length (seconds)
    pub slot_interval: u64,

    /// Number of forging delegates per round
    pub active_delegates: u32,

    /// Maximum sum of transaction bytes in one block
    pub max_payload_length: u32,

    /// Upper bound for any balance
    pub total_amount: i64,

    /// Maximum delegates one account may vote for
    pub max_votes_per_account: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            epoch_time: Utc
                .with_ymd_and_hms(2017, 11, 14, 11, 0, 0)
                .single()
                .unwrap_or_default(),
            slot_interval: 10,
            active_delegates: 101,
            max_payload_length: 1024 * 1024,
            total_amount: 10_000_000_000_000_000,
            max_votes_per_account: 33,
        }
    }
}

/// Block reward milestone schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Reward per block at each milestone
    pub milestones: Vec<u64>,

    /// Height at which rewards start
    pub offset: u64,

    /// Blocks between milestones
    pub distance: u64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            milestones: vec![0, 0, 0, 0, 0],
            offset: 1_451_520,
            distance: 3_000_000,
        }
    }
}

/// Sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Pause after each task (milliseconds)
    pub tick_delay_ms: u64,

    /// Queue depth at which a warning fires on every tick
    pub warning_limit: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            tick_delay_ms: 3,
            warning_limit: 50,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Volatile in-memory store
    Memory,
    /// RocksDB on disk
    RocksDb,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Which store to open
    pub backend: StoreBackend,

    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            data_dir: PathBuf::from("./data/ledger"),
            write_buffer_size_mb: 64,
            max_background_jobs: 4,
        }
    }
}

/// Correction applied to one historically miscalculated round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundException {
    /// Round the correction applies to
    pub round: u64,

    /// Multiplier applied to every slot reward
    pub rewards_factor: Decimal,

    /// Multiplier applied to the round fees
    pub fees_factor: Decimal,

    /// Amount added to the round fees after scaling
    pub fees_bonus: Decimal,
}

/// Static table of round corrections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionsConfig {
    /// Rounds with a correction
    pub rounds: Vec<RoundException>,
}

impl ExceptionsConfig {
    /// Index corrections by round number
    pub fn by_round(&self) -> BTreeMap<u64, RoundException> {
        self.rounds
            .iter()
            .map(|exception| (exception.round, exception.clone()))
            .collect()
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML document
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("DPOS_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(backend) = std::env::var("DPOS_STORE") {
            config.storage.backend = match backend.as_str() {
                "memory" => StoreBackend::Memory,
                "rocksdb" => StoreBackend::RocksDb,
                other => {
                    return Err(crate::Error::Config(format!(
                        "Unknown store backend: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(tick) = std::env::var("DPOS_SEQUENCER_TICK_MS") {
            config.sequencer.tick_delay_ms = tick
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid tick delay: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject constants no node could run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.chain.active_delegates == 0 {
            return Err(crate::Error::Config(
                "active_delegates must be positive".to_string(),
            ));
        }
        if self.chain.slot_interval == 0 {
            return Err(crate::Error::Config(
                "slot_interval must be positive".to_string(),
            ));
        }
        if self.rewards.milestones.is_empty() || self.rewards.distance == 0 {
            return Err(crate::Error::Config(
                "reward schedule needs milestones and a positive distance".to_string(),
            ));
        }
        if self.chain.total_amount <= 0 {
            return Err(crate::Error::Config(
                "total_amount must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
