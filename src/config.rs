//! Node configuration, loaded from an optional TOML file.

use serde::Deserialize;
use thiserror::Error;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::blockchain::consensus::MiningOptions;
use crate::blockchain::contract::SandboxLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub chain: ChainConfig,
    pub miner: MinerConfig,
    pub sandbox: SandboxConfig,
    pub mempool: MempoolConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Leading zero hex characters required of newly mined blocks
    pub difficulty: u32,
    /// Blocks declaring less than this are rejected
    pub min_difficulty: u32,
    /// Upper bound of the coinbase amount in a mined block
    pub mining_reward: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            difficulty: 4,
            min_difficulty: 0,
            mining_reward: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub max_attempts: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub max_txs_per_block: usize,
    /// Hex address receiving mining rewards; a fresh wallet is used when unset
    pub beneficiary: Option<String>,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            timeout_secs: None,
            max_txs_per_block: 100,
            beneficiary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_steps: u64,
    pub max_memory_bytes: usize,
    pub timeout_ms: u64,
    pub max_code_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = SandboxLimits::default();
        Self {
            max_steps: limits.max_steps,
            max_memory_bytes: limits.max_memory_bytes,
            timeout_ms: limits.timeout.as_millis() as u64,
            max_code_bytes: limits.max_code_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    pub max_size: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self { max_size: 1_000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sled directory; the chain lives in memory only when unset
    pub path: Option<PathBuf>,
}

impl LedgerConfig {
    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            max_steps: self.sandbox.max_steps,
            max_memory_bytes: self.sandbox.max_memory_bytes,
            timeout: Duration::from_millis(self.sandbox.timeout_ms),
            max_code_bytes: self.sandbox.max_code_bytes,
        }
    }

    pub fn mining_options(&self) -> MiningOptions {
        MiningOptions {
            max_attempts: self.miner.max_attempts,
            timeout: self.miner.timeout_secs.map(Duration::from_secs),
        }
    }

    /// Parses a TOML document and validates it
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: LedgerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };

        if self.chain.difficulty > 64 {
            return invalid("chain.difficulty", "must be at most 64");
        }
        if self.chain.min_difficulty > self.chain.difficulty {
            return invalid("chain.min_difficulty", "must not exceed chain.difficulty");
        }
        if self.mempool.max_size == 0 {
            return invalid("mempool.max_size", "must be positive");
        }
        if self.miner.max_txs_per_block == 0 {
            return invalid("miner.max_txs_per_block", "must be positive");
        }
        if self.sandbox.max_steps == 0 {
            return invalid("sandbox.max_steps", "must be positive");
        }
        if self.sandbox.max_memory_bytes == 0 {
            return invalid("sandbox.max_memory_bytes", "must be positive");
        }
        if self.sandbox.timeout_ms == 0 {
            return invalid("sandbox.timeout_ms", "must be positive");
        }
        if self.sandbox.max_code_bytes == 0 {
            return invalid("sandbox.max_code_bytes", "must be positive");
        }
        Ok(())
    }
}

/// Loads the configuration at `path`, or the defaults when no path is given
pub fn load_config(path: Option<&Path>) -> Result<LedgerConfig, ConfigError> {
    let path = match path {
        Some(path) => path,
        None => return Ok(LedgerConfig::default()),
    };

    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    LedgerConfig::from_toml(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.chain.difficulty, 4);
        assert_eq!(config.chain.mining_reward, 50);
        assert_eq!(config.miner.max_txs_per_block, 100);
        assert_eq!(config.mempool.max_size, 1_000);
        assert_eq!(config.sandbox_limits(), SandboxLimits::default());
        assert_eq!(config.mining_options(), MiningOptions::default());
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[chain]\ndifficulty = 2\n\n[miner]\ntimeout_secs = 5\n\n[storage]\npath = \"/tmp/ledger\""
        )
        .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.chain.difficulty, 2);
        assert_eq!(config.chain.mining_reward, 50);
        assert_eq!(config.mining_options().timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/ledger")));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            LedgerConfig::from_toml("[chain]\ndifficulty = 65\n"),
            Err(ConfigError::Invalid { field: "chain.difficulty", .. })
        ));
        assert!(matches!(
            LedgerConfig::from_toml("[mempool]\nmax_size = 0\n"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            LedgerConfig::from_toml("[sandbox]\ntimeout_ms = 0\n"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            LedgerConfig::from_toml("[chain\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = load_config(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
