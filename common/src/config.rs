use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// The main configuration structure for a block-producing node
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NodeConfig {
    pub node: LocalNodeConfig,
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub honor_nodes: Vec<HonorNodeConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Identity of this node
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LocalNodeConfig {
    /// Position of this node in the honor-node list
    pub position: i64,
    /// Seed of the node's Ed25519 signing key
    pub key_seed: u64,
    pub key_id: i64,
    #[serde(default = "default_ecosystem")]
    pub ecosystem: i64,
}

/// How block producers are elected
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    /// Time-sliced rotation over the honor-node list
    RoundRobin,
    /// One implicit producer; signature checks are skipped
    SingleNode,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConsensusConfig {
    pub mode: ConsensusMode,
    pub generation_time_secs: u64,
    pub blocks_gap_secs: u64,
    /// Timestamp of the genesis block; anchors the slot schedule
    pub first_block_time: i64,
}

/// Per-block admission ceilings
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LimitsConfig {
    pub max_tx_count: u64,
    pub max_block_generation_time_ms: u64,
    pub max_tx_per_user: u64,
    /// Fallback for ecosystems without a `max_tx_block_per_user` parameter
    pub max_tx_per_ecosystem_user: u64,
    pub max_block_size: u64,
    pub max_tx_size: u64,
    pub max_block_fuel: u64,
    pub max_tx_fuel: u64,
    pub ban_duration_secs: i64,
}

/// A registered producer
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HonorNodeConfig {
    pub key_id: i64,
    /// Seed to derive the public key from; used by local test networks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_seed: Option<u64>,
    /// Hex-encoded Ed25519 public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub address: String,
    /// Set when the remote is known to be unusable
    #[serde(default)]
    pub stopped: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub generator_tick_ms: u64,
}

/// Default values for configuration parameters
pub mod defaults {
    pub const GENERATION_TIME_SECS: u64 = 2;
    pub const BLOCKS_GAP_SECS: u64 = 1;
    pub const MAX_TX_COUNT: u64 = 1000;
    pub const MAX_BLOCK_GENERATION_TIME_MS: u64 = 2000;
    pub const MAX_TX_PER_USER: u64 = 100;
    pub const MAX_TX_PER_ECOSYSTEM_USER: u64 = 100;
    pub const MAX_BLOCK_SIZE: u64 = 64 * 1024 * 1024; // 64MB
    pub const MAX_TX_SIZE: u64 = 32 * 1024 * 1024; // 32MB
    pub const MAX_BLOCK_FUEL: u64 = 100_000_000;
    pub const MAX_TX_FUEL: u64 = 10_000_000;
    pub const BAN_DURATION_SECS: i64 = 15 * 60;
    pub const QUEUE_CAPACITY: usize = 256;
    pub const GENERATOR_TICK_MS: u64 = 500;
}

fn default_ecosystem() -> i64 {
    1
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tx_count: defaults::MAX_TX_COUNT,
            max_block_generation_time_ms: defaults::MAX_BLOCK_GENERATION_TIME_MS,
            max_tx_per_user: defaults::MAX_TX_PER_USER,
            max_tx_per_ecosystem_user: defaults::MAX_TX_PER_ECOSYSTEM_USER,
            max_block_size: defaults::MAX_BLOCK_SIZE,
            max_tx_size: defaults::MAX_TX_SIZE,
            max_block_fuel: defaults::MAX_BLOCK_FUEL,
            max_tx_fuel: defaults::MAX_TX_FUEL,
            ban_duration_secs: defaults::BAN_DURATION_SECS,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::QUEUE_CAPACITY,
            generator_tick_ms: defaults::GENERATOR_TICK_MS,
        }
    }
}

impl NodeConfig {
    /// Loads the configuration from the default location, falling back to
    /// development defaults when no file exists
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_config_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::warn!("no node configuration found, using development defaults");
                Ok(Self::development())
            }
        }
    }

    /// Loads the configuration from a specific path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Determines the default configuration path
    fn default_config_path() -> Option<PathBuf> {
        if let Ok(path) = env::var("TESSERA_CONFIG") {
            return Some(PathBuf::from(path));
        }

        let config_dir = PathBuf::from("config");

        // Environment-specific config wins over the plain one
        let env = env::var("TESSERA_ENV").unwrap_or_else(|_| "development".to_string());
        let env_specific_path = config_dir.join(format!("node.{}.toml", env));
        if env_specific_path.exists() {
            return Some(env_specific_path);
        }

        let default_path = config_dir.join("node.toml");
        if default_path.exists() {
            return Some(default_path);
        }

        None
    }

    /// A single-node development network producing from seed 0
    pub fn development() -> Self {
        Self {
            node: LocalNodeConfig {
                position: 0,
                key_seed: 0,
                key_id: 1,
                ecosystem: default_ecosystem(),
            },
            consensus: ConsensusConfig {
                mode: ConsensusMode::SingleNode,
                generation_time_secs: defaults::GENERATION_TIME_SECS,
                blocks_gap_secs: defaults::BLOCKS_GAP_SECS,
                first_block_time: 0,
            },
            limits: LimitsConfig::default(),
            honor_nodes: Vec::new(),
            pipeline: PipelineConfig::default(),
        }
    }

    /// Length of one producer slot in seconds
    pub fn slot_duration_secs(&self) -> u64 {
        self.consensus.generation_time_secs + self.consensus.blocks_gap_secs
    }

    /// Validates the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_duration_secs() == 0 {
            return Err(ConfigError::Validation(
                "Slot duration (generation time + blocks gap) must be greater than 0".to_string(),
            ));
        }

        let limits = &self.limits;
        let ceilings = [
            ("max_tx_count", limits.max_tx_count),
            ("max_block_generation_time_ms", limits.max_block_generation_time_ms),
            ("max_tx_per_user", limits.max_tx_per_user),
            ("max_tx_per_ecosystem_user", limits.max_tx_per_ecosystem_user),
            ("max_block_size", limits.max_block_size),
            ("max_tx_size", limits.max_tx_size),
            ("max_block_fuel", limits.max_block_fuel),
            ("max_tx_fuel", limits.max_tx_fuel),
        ];
        if let Some((name, _)) = ceilings.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation(format!(
                "Limit {} must be greater than 0",
                name
            )));
        }

        if limits.max_tx_size > limits.max_block_size {
            return Err(ConfigError::Validation(
                "Maximum transaction size cannot exceed maximum block size".to_string(),
            ));
        }

        if self.consensus.mode == ConsensusMode::RoundRobin {
            let position = self.node.position;
            if position < 0 || position as usize >= self.honor_nodes.len() {
                return Err(ConfigError::Validation(format!(
                    "Node position {} is outside the honor-node list of {} nodes",
                    position,
                    self.honor_nodes.len()
                )));
            }
        }

        for node in &self.honor_nodes {
            if node.key_seed.is_none() && node.public_key.is_none() {
                return Err(ConfigError::Validation(format!(
                    "Honor node {} needs a key_seed or a public_key",
                    node.key_id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ROUND_ROBIN_TOML: &str = r#"
        [node]
        position = 1
        key_seed = 11
        key_id = 2

        [consensus]
        mode = "round_robin"
        generation_time_secs = 4
        blocks_gap_secs = 1
        first_block_time = 1000

        [[honor_nodes]]
        key_id = 1
        key_seed = 10

        [[honor_nodes]]
        key_id = 2
        key_seed = 11
        address = "127.0.0.1:7079"
    "#;

    #[test]
    fn test_development_config() {
        let config = NodeConfig::development();
        assert_eq!(config.consensus.mode, ConsensusMode::SingleNode);
        assert_eq!(config.slot_duration_secs(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ROUND_ROBIN_TOML.as_bytes()).unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.consensus.mode, ConsensusMode::RoundRobin);
        assert_eq!(config.honor_nodes.len(), 2);
        assert_eq!(config.node.ecosystem, 1);
        assert_eq!(config.limits.max_tx_count, defaults::MAX_TX_COUNT);
        assert_eq!(config.pipeline.queue_capacity, defaults::QUEUE_CAPACITY);
    }

    #[test]
    fn test_validation() {
        let mut config = NodeConfig::development();
        config.consensus.generation_time_secs = 0;
        config.consensus.blocks_gap_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = NodeConfig::development();
        config.limits.max_block_fuel = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        // Round robin needs this node in the honor list
        let mut config = NodeConfig::development();
        config.consensus.mode = ConsensusMode::RoundRobin;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_invalid_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[node]\nposition = \"first\"").unwrap();
        assert!(matches!(
            NodeConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_serialization() {
        let config = NodeConfig::development();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: NodeConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(config.node.key_seed, deserialized.node.key_seed);
        assert_eq!(config.consensus.mode, deserialized.consensus.mode);
    }
}
