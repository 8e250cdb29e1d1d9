// ════════════════════════════════════════════════════════════════════════════
// CHAIN ERROR TAXONOMY
// ════════════════════════════════════════════════════════════════════════════
// Validation  -> malformed / mis-signed input, rejected, never retried
// State       -> input is well-formed but the ledger says no
// Consistency -> derived data disagrees with itself, triggers rebuild/fallback
// Persistence -> storage I/O failed, caller decides retry vs halt
// Consensus   -> nobody can produce right now, retry next interval
// ════════════════════════════════════════════════════════════════════════════

use thiserror::Error;

use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::types::{Address, Amount};
use crate::validator::ValidatorStatus;

pub type ChainResult<T> = Result<T, ChainError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("duplicate transaction {0}")]
    DuplicateTransaction(String),

    #[error("malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("invalid transaction signature for {0}")]
    BadTransactionSignature(String),

    #[error("fee {fee} below minimum {min}")]
    FeeTooLow { fee: Amount, min: Amount },

    #[error("malformed block at height {height}: {reason}")]
    MalformedBlock { height: u64, reason: String },

    #[error("invalid proposer signature on block at height {0}")]
    BadBlockSignature(u64),

    #[error("merkle root mismatch at height {0}")]
    MerkleRootMismatch(u64),

    #[error("block at height {height} proposed by {got}, expected {expected}")]
    WrongProposer { height: u64, expected: Address, got: Address },

    #[error("block reward mismatch at height {height}: expected {expected}, got {got}")]
    RewardMismatch { height: u64, expected: Amount, got: Amount },

    #[error("block timestamp out of range at height {0}")]
    TimestampOutOfRange(u64),

    #[error("invalid double-sign evidence: {0}")]
    InvalidEvidence(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("insufficient balance for {address}: need {needed}, have {available}")]
    InsufficientBalance { address: Address, needed: Amount, available: Amount },

    #[error("insufficient stake for {address}: need {needed}, have {available}")]
    InsufficientStake { address: Address, needed: Amount, available: Amount },

    #[error("stale nonce {nonce} for {address} (current {current})")]
    StaleNonce { address: Address, nonce: u64, current: u64 },

    #[error("future nonce {nonce} for {address} (expected {expected})")]
    FutureNonce { address: Address, nonce: u64, expected: u64 },

    #[error("{address} already received this bonus")]
    AlreadyRewarded { address: Address },

    #[error("distribution window closed")]
    DistributionClosed,

    #[error("early validator bonus slots exhausted")]
    EarlySlotsExhausted,

    #[error("maximum supply reached")]
    SupplyExhausted,

    #[error("validator {0} not found")]
    ValidatorNotFound(Address),

    #[error("validator {address}: transition {from:?} -> {to:?} not allowed")]
    InvalidTransition { address: Address, from: ValidatorStatus, to: ValidatorStatus },

    #[error("validator {address} jailed until {until}")]
    StillJailed { address: Address, until: u64 },

    #[error("block height {got} does not follow tip {expected}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("block at height {0} does not extend the current tip")]
    ParentMismatch(u64),

    #[error("mempool full and fee-per-byte not above pool minimum")]
    PoolFull,

    #[error("arithmetic overflow: {0}")]
    Overflow(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("block index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("block log unreadable: {0}")]
    LogCorrupted(String),

    #[error("checkpoint {id} failed integrity check: {reason}")]
    CheckpointIntegrity { id: u64, reason: String },

    #[error("block {0} referenced by index is missing from the log")]
    MissingBlock(String),

    #[error("undo journal missing for height {0}")]
    UndoUnavailable(u64),

    #[error("ledger tip mismatch: {0}")]
    LedgerMismatch(String),

    #[error("no usable recovery point: {0}")]
    NoRecoveryPoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    #[error("no eligible proposer for height {0}")]
    NoEligibleProposer(u64),

    #[error("validator set too small: {active} active, {required} required")]
    ValidatorSetTooSmall { active: usize, required: usize },

    #[error("{0} is not the proposer of the current slot")]
    NotProposer(Address),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl ChainError {
    /// Short category label for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            ChainError::Validation(_) => "validation",
            ChainError::State(_) => "state",
            ChainError::Consistency(_) => "consistency",
            ChainError::Persistence(_) => "persistence",
            ChainError::Consensus(_) => "consensus",
            ChainError::Config(_) => "config",
        }
    }

    /// Whether the node can keep producing after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ChainError::Persistence(StorageError::Corrupt(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        let e: ChainError = StateError::PoolFull.into();
        assert_eq!(e.kind(), "state");
        assert!(e.is_recoverable());

        let e: ChainError = StorageError::Corrupt("bad page".into()).into();
        assert_eq!(e.kind(), "persistence");
        assert!(!e.is_recoverable());
    }

    #[test]
    fn messages_carry_reason() {
        let e: ChainError = ConsensusError::ValidatorSetTooSmall { active: 0, required: 1 }.into();
        assert_eq!(
            e.to_string(),
            "consensus error: validator set too small: 0 active, 1 required"
        );
    }
}
