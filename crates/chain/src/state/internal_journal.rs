//! Inverse-operation journal.
//!
//! Ops are deltas, not saved values, so missed-slot penalties applied
//! between blocks survive reverting a block. Double-sign penalties are
//! lifted by the block store before it reverts the blocks below them; a
//! tombstoned validator is never removed or moved out of the tombstone here.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::ConsistencyError;
use crate::types::{Address, Amount, Hash};
use crate::validator::ValidatorStatus;

use super::ChainState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BonusKind {
    Developer,
    EarlyValidator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerOp {
    TipAdvanced { previous_height: u64, previous_hash: Option<Hash>, previous_timestamp: u64 },
    Credited { address: Address, amount: Amount },
    Debited { address: Address, amount: Amount },
    NonceSet { address: Address, previous: u64 },
    Staked { address: Address, amount: Amount },
    Unstaked { address: Address, amount: Amount },
    StatusChanged { address: Address, from: ValidatorStatus, to: ValidatorStatus },
    ValidatorCreated { address: Address },
    ProducedBlock { address: Address, reputation_gain: u32, missed_before: u64 },
    Unjailed { address: Address, jailed_until: Option<u64>, missed_blocks: u64 },
    Minted { amount: Amount },
    BonusClaimed { address: Address, kind: BonusKind },
}

/// Everything needed to revert one applied block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub height: u64,
    pub hash: Hash,
    pub ops: Vec<LedgerOp>,
}

impl ChainState {
    /// Revert the tip block. `undo` must belong to the current tip.
    pub fn undo_block(&mut self, undo: &BlockUndo) -> Result<(), ConsistencyError> {
        if self.tip_hash != Some(undo.hash) || self.height != undo.height {
            return Err(ConsistencyError::LedgerMismatch(format!(
                "undo for {} at {} but tip is {:?} at {}",
                undo.hash.short(),
                undo.height,
                self.tip_hash.map(|h| h.short()),
                self.height
            )));
        }
        self.revert_ops(&undo.ops);
        Ok(())
    }

    pub(crate) fn revert_ops(&mut self, ops: &[LedgerOp]) {
        for op in ops.iter().rev() {
            self.revert_op(op);
        }
    }

    fn revert_op(&mut self, op: &LedgerOp) {
        match op {
            LedgerOp::TipAdvanced { previous_height, previous_hash, previous_timestamp } => {
                self.height = *previous_height;
                self.tip_hash = *previous_hash;
                self.last_block_timestamp = *previous_timestamp;
            }
            LedgerOp::Credited { address, amount } => {
                let bal = self.balance_of(address);
                if bal < *amount {
                    error!(%address, "undo credit exceeds balance");
                }
                self.set_balance(address, bal.saturating_sub(*amount));
            }
            LedgerOp::Debited { address, amount } => {
                let bal = self.balance_of(address);
                self.set_balance(address, bal.saturating_add(*amount));
            }
            LedgerOp::NonceSet { address, previous } => {
                if *previous == 0 {
                    self.nonces.remove(address);
                } else {
                    self.nonces.insert(*address, *previous);
                }
            }
            LedgerOp::Staked { address, amount } => {
                if let Some(v) = self.validators.get_mut(address) {
                    v.stake = v.stake.saturating_sub(*amount);
                }
            }
            LedgerOp::Unstaked { address, amount } => {
                if let Some(v) = self.validators.get_mut(address) {
                    v.stake = v.stake.saturating_add(*amount);
                }
            }
            LedgerOp::StatusChanged { address, from, to } => {
                // a later out-of-block penalty wins
                if let Some(v) = self.validators.get_mut(address) {
                    if v.status == *to && !v.status.is_terminal() {
                        v.status = *from;
                    }
                }
            }
            LedgerOp::ValidatorCreated { address } => {
                match self.validators.get(address) {
                    Some(v) if v.status.is_terminal() => {
                        warn!(%address, "keeping tombstoned validator on undo");
                    }
                    _ => {
                        self.validators.remove(address);
                    }
                }
            }
            LedgerOp::ProducedBlock { address, reputation_gain, missed_before } => {
                if let Some(v) = self.validators.get_mut(address) {
                    v.produced_blocks = v.produced_blocks.saturating_sub(1);
                    v.reputation = v.reputation.saturating_sub(*reputation_gain);
                    v.missed_blocks = v.missed_blocks.saturating_add(*missed_before);
                }
            }
            LedgerOp::Unjailed { address, jailed_until, missed_blocks } => {
                if let Some(v) = self.validators.get_mut(address) {
                    v.jailed_until = *jailed_until;
                    v.missed_blocks = v.missed_blocks.saturating_add(*missed_blocks);
                }
            }
            LedgerOp::Minted { amount } => {
                self.total_minted = self.total_minted.saturating_sub(*amount);
            }
            LedgerOp::BonusClaimed { address, kind } => match kind {
                BonusKind::Developer => {
                    self.developer_rewarded.remove(address);
                }
                BonusKind::EarlyValidator => {
                    self.early_rewarded.remove(address);
                    if let Some(v) = self.validators.get_mut(address) {
                        v.distribution_reward_claimed = false;
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_config;
    use crate::block::Block;
    use crate::crypto::{Ed25519Signer, KeySigner};
    use crate::state::ChainState;
    use crate::tokenomics::block_reward;
    use crate::tx::Transaction;
    use crate::types::SCALE;
    use crate::validator::ValidatorStatus;

    #[test]
    fn undo_restores_previous_state_exactly() {
        let op = Ed25519Signer::generate();
        let mut cfg = test_config(&op);
        cfg.distribution.end_ms = u64::MAX;
        let mut s = ChainState::new();
        let g = Block::genesis(0, cfg.reward.initial_reward, &op);
        s.apply_block(&cfg, &g).unwrap();
        let before = s.clone();

        let bob = Ed25519Signer::generate();
        let txs = vec![
            Transaction::transfer(bob.address(), 3 * SCALE, 1_000, 1, 1, &op),
            Transaction::stake(12 * SCALE, 1_000, 2, 1, &op),
        ];
        let reward = block_reward(&cfg.reward, 1, s.total_minted);
        let b1 = Block::build(1, Some(g.hash), 5, 0, reward, txs, &op);
        let applied = s.apply_block(&cfg, &b1).unwrap();
        assert_eq!(s.validators[&op.address()].status, ValidatorStatus::Active);
        assert!(!applied.bonuses.is_empty());
        assert!(s.is_conserved());

        s.undo_block(&applied.undo).unwrap();
        assert_eq!(s, before);
    }

    #[test]
    fn undo_of_non_tip_is_refused() {
        let op = Ed25519Signer::generate();
        let cfg = test_config(&op);
        let mut s = ChainState::new();
        let g = Block::genesis(0, cfg.reward.initial_reward, &op);
        let applied = s.apply_block(&cfg, &g).unwrap();
        let mut other = applied.undo.clone();
        other.height = 7;
        assert!(s.undo_block(&other).is_err());
    }

    #[test]
    fn undo_never_removes_a_tombstone() {
        let op = Ed25519Signer::generate();
        let cfg = test_config(&op);
        let mut s = ChainState::new();
        let g = Block::genesis(0, cfg.reward.initial_reward, &op);
        s.apply_block(&cfg, &g).unwrap();

        let reward = block_reward(&cfg.reward, 1, s.total_minted);
        let stake = Transaction::stake(12 * SCALE, 1_000, 1, 1, &op);
        let b1 = Block::build(1, Some(g.hash), 5, 0, reward, vec![stake], &op);
        let applied = s.apply_block(&cfg, &b1).unwrap();

        // tombstoned without going through the penalty records
        if let Some(v) = s.validators.get_mut(&op.address()) {
            v.status = ValidatorStatus::Tombstoned;
        }
        s.undo_block(&applied.undo).unwrap();
        assert_eq!(s.validators[&op.address()].status, ValidatorStatus::Tombstoned);
    }
}
