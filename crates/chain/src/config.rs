//! Immutable chain configuration.
//!
//! Built once at startup (defaults, JSON file, or code), checked with
//! [`ChainConfig::validate`], then shared as `Arc<ChainConfig>` by every
//! component. Nothing mutates it afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Address, Amount, SCALE};

/// Configuration range-check failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config field `{field}`: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn out_of_range(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::OutOfRange { field, reason: reason.into() }
}

// ════════════════════════════════════════════════════════════════════════════
// SECTIONS
// ════════════════════════════════════════════════════════════════════════════

/// Issuance schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Reward at height 0.
    pub initial_reward: Amount,
    /// Blocks between halvings.
    pub halving_interval: u64,
    /// Lower bound applied after halving.
    pub min_reward: Amount,
    /// Hard cap on cumulative minted amount.
    pub max_supply: Amount,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            initial_reward: 21 * SCALE,
            halving_interval: 210_000,
            min_reward: SCALE / 100,
            max_supply: 21_000_000 * SCALE,
        }
    }
}

/// Bootstrap bonus window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Window start, unix ms (inclusive).
    pub start_ms: u64,
    /// Window end, unix ms (exclusive).
    pub end_ms: u64,
    /// Genesis operator; the only proposer while no validator is active.
    pub genesis_operator: Address,
    pub developer_bonus: Amount,
    pub early_validator_bonus: Amount,
    pub max_early_validators: u32,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            start_ms: 0,
            end_ms: 0,
            genesis_operator: Address::ZERO,
            developer_bonus: 1_000 * SCALE,
            early_validator_bonus: 100 * SCALE,
            max_early_validators: 21,
        }
    }
}

impl DistributionConfig {
    pub fn is_open_at(&self, now_ms: u64) -> bool {
        now_ms >= self.start_ms && now_ms < self.end_ms
    }
}

/// Validator set, timing and penalties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub block_interval_ms: u64,
    /// Time the selected proposer has before the slot counts as missed.
    pub proposer_window_ms: u64,
    pub min_stake: Amount,
    /// Below this many active validators production pauses (bootstrap aside).
    pub min_validators: usize,
    pub initial_reputation: u32,
    pub reputation_gain: u32,
    pub reputation_penalty: u32,
    /// Consecutive misses that jail a validator.
    pub missed_block_threshold: u64,
    pub jail_duration_ms: u64,
    /// Percent of stake slashed on double-signing.
    pub double_sign_slash_percent: u8,
    pub max_block_transactions: usize,
    pub max_block_bytes: usize,
    /// Tolerated drift of a block timestamp into the future.
    pub max_future_drift_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            block_interval_ms: 5_000,
            proposer_window_ms: 3_000,
            min_stake: 10 * SCALE,
            min_validators: 1,
            initial_reputation: 500,
            reputation_gain: 1,
            reputation_penalty: 10,
            missed_block_threshold: 10,
            jail_duration_ms: 10 * 60 * 1000,
            double_sign_slash_percent: 10,
            max_block_transactions: 1_000,
            max_block_bytes: 1024 * 1024,
            max_future_drift_ms: 15_000,
        }
    }
}

/// Transaction pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    pub max_transactions: usize,
    pub max_bytes: usize,
    pub min_fee: Amount,
    pub expiration_ms: u64,
    pub persist: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_transactions: 30_000,
            max_bytes: 64 * 1024 * 1024,
            min_fee: 1_000,
            expiration_ms: 60 * 60 * 1000,
            persist: true,
        }
    }
}

/// Checkpointing and block store retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Blocks between automatic checkpoints. 0 disables them.
    pub interval_blocks: u64,
    pub max_checkpoints: usize,
    /// Undo journals kept for cheap reorgs.
    pub max_reorg_depth: u64,
    pub max_orphans: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_blocks: 1_000,
            max_checkpoints: 5,
            max_reorg_depth: 100,
            max_orphans: 256,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CHAIN CONFIG
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChainConfig {
    pub reward: RewardConfig,
    pub distribution: DistributionConfig,
    pub consensus: ConsensusConfig,
    pub mempool: MempoolConfig,
    pub checkpoint: CheckpointConfig,
}

impl ChainConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: ChainConfig = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Range checks only. Policy is the operator's business.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.reward;
        if r.halving_interval == 0 {
            return Err(out_of_range("reward.halving_interval", "must be > 0"));
        }
        if r.initial_reward == 0 {
            return Err(out_of_range("reward.initial_reward", "must be > 0"));
        }
        if r.min_reward > r.initial_reward {
            return Err(out_of_range("reward.min_reward", "must not exceed initial_reward"));
        }
        if r.max_supply < r.initial_reward {
            return Err(out_of_range("reward.max_supply", "must be at least initial_reward"));
        }

        let d = &self.distribution;
        if d.end_ms < d.start_ms {
            return Err(out_of_range("distribution.end_ms", "must not precede start_ms"));
        }

        let c = &self.consensus;
        if c.block_interval_ms == 0 {
            return Err(out_of_range("consensus.block_interval_ms", "must be > 0"));
        }
        if c.proposer_window_ms == 0 || c.proposer_window_ms > c.block_interval_ms {
            return Err(out_of_range(
                "consensus.proposer_window_ms",
                "must be in 1..=block_interval_ms",
            ));
        }
        if c.min_stake == 0 {
            return Err(out_of_range("consensus.min_stake", "must be > 0"));
        }
        if c.min_validators == 0 {
            return Err(out_of_range("consensus.min_validators", "must be > 0"));
        }
        if c.initial_reputation > crate::validator::REPUTATION_MAX {
            return Err(out_of_range("consensus.initial_reputation", "must be <= 1000"));
        }
        if c.missed_block_threshold == 0 {
            return Err(out_of_range("consensus.missed_block_threshold", "must be > 0"));
        }
        if c.double_sign_slash_percent > 100 {
            return Err(out_of_range("consensus.double_sign_slash_percent", "must be <= 100"));
        }
        if c.max_block_transactions == 0 || c.max_block_bytes == 0 {
            return Err(out_of_range("consensus.max_block_*", "block limits must be > 0"));
        }

        let m = &self.mempool;
        if m.max_transactions == 0 || m.max_bytes == 0 {
            return Err(out_of_range("mempool.max_*", "pool limits must be > 0"));
        }
        if m.expiration_ms == 0 {
            return Err(out_of_range("mempool.expiration_ms", "must be > 0"));
        }

        let k = &self.checkpoint;
        if k.interval_blocks > 0 && k.max_checkpoints == 0 {
            return Err(out_of_range("checkpoint.max_checkpoints", "must be > 0 when enabled"));
        }
        if k.max_reorg_depth == 0 {
            return Err(out_of_range("checkpoint.max_reorg_depth", "must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ChainConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_halving_interval() {
        let mut cfg = ChainConfig::default();
        cfg.reward.halving_interval = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("halving_interval"));
    }

    #[test]
    fn rejects_window_longer_than_interval() {
        let mut cfg = ChainConfig::default();
        cfg.consensus.proposer_window_ms = cfg.consensus.block_interval_ms + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg = ChainConfig::from_json_str(r#"{"reward":{"halving_interval":10}}"#).unwrap();
        assert_eq!(cfg.reward.halving_interval, 10);
        assert_eq!(cfg.reward.initial_reward, 21 * SCALE);
        assert_eq!(cfg.mempool, MempoolConfig::default());
    }

    #[test]
    fn inverted_distribution_window_rejected() {
        let mut cfg = ChainConfig::default();
        cfg.distribution.start_ms = 10;
        cfg.distribution.end_ms = 5;
        assert!(cfg.validate().is_err());
    }
}
