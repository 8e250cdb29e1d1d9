//! Account ledger.
//!
//! `ChainState` is the single source of truth for balances, nonces, stakes
//! and validator records. Every mutation made while applying a block is
//! recorded as a [`LedgerOp`] so the block can be reverted exactly, and as a
//! [`UtxoOp`] so the UTXO index can follow.
//!
//! Logic is split across `internal_*` files, each an `impl ChainState` block:
//!
//! | file                  | concern                                      |
//! |-----------------------|----------------------------------------------|
//! | `internal_account`    | balances, nonces, `apply_transaction`         |
//! | `internal_staking`    | stake moves, liveness, unjail, slashing       |
//! | `internal_rewards`    | block reward and distribution bonuses         |
//! | `internal_journal`    | undo ops and block revert                     |
//! | `internal_snapshot`   | full snapshot / restore                       |
//! | `internal_state_root` | deterministic state digest                    |

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::block::Block;
use crate::config::ChainConfig;
use crate::consensus::proposer;
use crate::error::{ChainResult, StateError, ValidationError};
use crate::types::{Address, Amount, Hash};
use crate::utxo::{coinbase_id, UtxoOp};
use crate::validator::{Validator, ValidatorStatus};

mod internal_account;
mod internal_journal;
mod internal_rewards;
mod internal_snapshot;
mod internal_staking;
mod internal_state_root;

pub use internal_journal::{BlockUndo, BonusKind, LedgerOp};
pub use internal_snapshot::StateSnapshot;
pub use internal_staking::{MissReport, SlashRecord, SlashReport};

/// Side effects collected while a block is applied.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub ops: Vec<LedgerOp>,
    pub utxo: Vec<UtxoOp>,
    /// Validators that became Active in this block, in order.
    pub activated: Vec<Address>,
}

/// Result of applying one block to the ledger.
#[derive(Debug, Clone)]
pub struct AppliedBlock {
    pub undo: BlockUndo,
    pub utxo_ops: Vec<UtxoOp>,
    pub reward: Amount,
    pub fees: Amount,
    pub bonuses: Vec<(Address, BonusKind, Amount)>,
}

impl AppliedBlock {
    /// Validator status changes made by the block, in order.
    pub fn status_changes(&self) -> Vec<(Address, ValidatorStatus, ValidatorStatus)> {
        self.undo
            .ops
            .iter()
            .filter_map(|op| match op {
                LedgerOp::StatusChanged { address, from, to } => Some((*address, *from, *to)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    // ════════════════════════════════════════════════════════════════════
    // TIP
    // ════════════════════════════════════════════════════════════════════
    /// Height of the last applied block (0 before and after genesis).
    pub height: u64,
    /// `None` until genesis is applied.
    pub tip_hash: Option<Hash>,
    pub last_block_timestamp: u64,

    // ════════════════════════════════════════════════════════════════════
    // ACCOUNTS
    // ════════════════════════════════════════════════════════════════════
    /// Spendable balance. Zero balances are not stored.
    pub balances: BTreeMap<Address, Amount>,
    /// Last used nonce. Zero nonces are not stored.
    pub nonces: BTreeMap<Address, u64>,

    // ════════════════════════════════════════════════════════════════════
    // VALIDATORS
    // ════════════════════════════════════════════════════════════════════
    pub validators: BTreeMap<Address, Validator>,

    // ════════════════════════════════════════════════════════════════════
    // ISSUANCE
    // ════════════════════════════════════════════════════════════════════
    /// Cumulative minted amount; equals balances + stakes at every height.
    pub total_minted: Amount,
    pub developer_rewarded: BTreeSet<Address>,
    pub early_rewarded: BTreeSet<Address>,

    // ════════════════════════════════════════════════════════════════════
    // PENALTIES
    // ════════════════════════════════════════════════════════════════════
    /// Double-sign penalties in force, keyed by evidence id. Not part of
    /// any block: lifted before the blocks below them are reverted and
    /// enforced again afterwards.
    pub slashes: BTreeMap<Hash, SlashRecord>,
}

impl ChainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_genesis(&self) -> bool {
        self.tip_hash.is_some()
    }

    pub fn get_validator(&self, address: &Address) -> Option<&Validator> {
        self.validators.get(address)
    }

    /// Active validators at or above `min_stake`, ordered by address.
    pub fn eligible_validators(&self, min_stake: Amount) -> Vec<&Validator> {
        self.validators.values().filter(|v| v.is_eligible(min_stake)).collect()
    }

    pub fn total_stake(&self) -> Amount {
        self.validators.values().fold(0u128, |acc, v| acc.saturating_add(v.stake))
    }

    pub fn total_balances(&self) -> Amount {
        self.balances.values().fold(0u128, |acc, b| acc.saturating_add(*b))
    }

    /// Conservation: every minted unit is either spendable or staked.
    pub fn is_conserved(&self) -> bool {
        self.total_balances().saturating_add(self.total_stake()) == self.total_minted
    }

    // ────────────────────────────────────────────────────────────────────────
    // apply_block
    // ────────────────────────────────────────────────────────────────────────

    /// Apply `block` on top of the current tip.
    ///
    /// All-or-nothing: on error every mutation made so far is reverted.
    ///
    /// ## Checks
    /// - height and parent extend the tip (genesis only on an empty ledger)
    /// - timestamp does not go backwards
    /// - proposer is the one selected for `(parent, height, round)`
    /// - header reward equals the scheduled, supply-capped reward
    pub fn apply_block(&mut self, cfg: &ChainConfig, block: &Block) -> ChainResult<AppliedBlock> {
        self.apply(cfg, block, true)
    }

    /// Re-apply a block this node accepted before (startup and checkpoint
    /// replay). Skips the proposer check: selection depends on node-local
    /// liveness penalties that a replay does not reproduce.
    pub fn replay_block(&mut self, cfg: &ChainConfig, block: &Block) -> ChainResult<AppliedBlock> {
        self.apply(cfg, block, false)
    }

    fn apply(&mut self, cfg: &ChainConfig, block: &Block, check_proposer: bool) -> ChainResult<AppliedBlock> {
        self.check_extends_tip(block)?;
        if block.header.timestamp < self.last_block_timestamp {
            return Err(ValidationError::TimestampOutOfRange(block.height()).into());
        }
        if let (true, Some(parent)) = (check_proposer, block.parent()) {
            let expected = proposer::expected_proposer(self, cfg, &parent, block.height(), block.header.round)?;
            if expected != block.header.proposer {
                return Err(ValidationError::WrongProposer {
                    height: block.height(),
                    expected,
                    got: block.header.proposer,
                }
                .into());
            }
        }

        let mut fx = Effects::default();
        match self.apply_block_inner(cfg, block, &mut fx) {
            Ok((reward, fees, bonuses)) => {
                debug!(
                    height = block.height(),
                    hash = %block.hash.short(),
                    txs = block.transactions.len(),
                    reward,
                    fees,
                    "block applied to ledger"
                );
                Ok(AppliedBlock {
                    undo: BlockUndo { height: block.height(), hash: block.hash, ops: fx.ops },
                    utxo_ops: fx.utxo,
                    reward,
                    fees,
                    bonuses,
                })
            }
            Err(e) => {
                self.revert_ops(&fx.ops);
                warn!(height = block.height(), error = %e, "block rejected by ledger");
                Err(e)
            }
        }
    }

    fn check_extends_tip(&self, block: &Block) -> Result<(), StateError> {
        match self.tip_hash {
            None => {
                if !block.is_genesis() {
                    return Err(StateError::HeightMismatch { expected: 0, got: block.height() });
                }
            }
            Some(tip) => {
                let expected = self.height + 1;
                if block.height() != expected {
                    return Err(StateError::HeightMismatch { expected, got: block.height() });
                }
                if block.parent() != Some(tip) {
                    return Err(StateError::ParentMismatch(block.height()));
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn apply_block_inner(
        &mut self,
        cfg: &ChainConfig,
        block: &Block,
        fx: &mut Effects,
    ) -> ChainResult<(Amount, Amount, Vec<(Address, BonusKind, Amount)>)> {
        let ts = block.header.timestamp;
        let proposer = block.header.proposer;
        let cb = coinbase_id(&block.hash);

        fx.ops.push(LedgerOp::TipAdvanced {
            previous_height: self.height,
            previous_hash: self.tip_hash,
            previous_timestamp: self.last_block_timestamp,
        });
        self.height = block.height();
        self.tip_hash = Some(block.hash);
        self.last_block_timestamp = ts;

        let reward = self.process_block_reward(cfg, fx, block)?;
        self.record_produced(cfg, fx, &proposer);

        let mut bonuses = Vec::new();
        if proposer == cfg.distribution.genesis_operator {
            match self.award_developer_node_reward(cfg, fx, cb, &proposer, ts) {
                Ok(amount) => bonuses.push((proposer, BonusKind::Developer, amount)),
                Err(e) => debug!(reason = %e, "developer bonus skipped"),
            }
        }

        let mut fees: Amount = 0;
        for tx in &block.transactions {
            self.apply_transaction(cfg, fx, tx, &proposer, ts)?;
            fees = fees.saturating_add(tx.fee);
        }

        let activated = std::mem::take(&mut fx.activated);
        for address in activated {
            match self.award_early_validator_reward(cfg, fx, cb, &address, ts) {
                Ok(amount) => bonuses.push((address, BonusKind::EarlyValidator, amount)),
                Err(e) => debug!(validator = %address, reason = %e, "early validator bonus skipped"),
            }
        }
        Ok((reward, fees, bonuses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519Signer, KeySigner};
    use crate::tx::Transaction;
    use crate::types::SCALE;

    pub(crate) fn test_config(operator: &Ed25519Signer) -> ChainConfig {
        let mut cfg = ChainConfig::default();
        cfg.distribution.genesis_operator = operator.address();
        cfg.consensus.min_stake = 10 * SCALE;
        cfg
    }

    fn next_block(state: &ChainState, cfg: &ChainConfig, txs: Vec<Transaction>, signer: &Ed25519Signer) -> Block {
        let height = state.height + 1;
        let reward = crate::tokenomics::block_reward(&cfg.reward, height, state.total_minted);
        Block::build(height, state.tip_hash, state.last_block_timestamp + 1, 0, reward, txs, signer)
    }

    fn genesis(cfg: &ChainConfig, op: &Ed25519Signer) -> (ChainState, Block) {
        let mut state = ChainState::new();
        let g = Block::genesis(0, cfg.reward.initial_reward, op);
        state.apply_block(cfg, &g).unwrap();
        (state, g)
    }

    #[test]
    fn genesis_mints_reward_to_operator() {
        let op = Ed25519Signer::generate();
        let cfg = test_config(&op);
        let (state, g) = genesis(&cfg, &op);
        assert_eq!(state.tip_hash, Some(g.hash));
        assert_eq!(state.balances[&op.address()], 21 * SCALE);
        assert!(state.is_conserved());
    }

    #[test]
    fn rejects_non_genesis_on_empty_ledger() {
        let op = Ed25519Signer::generate();
        let cfg = test_config(&op);
        let b = Block::build(1, Some(Hash::ZERO), 0, 0, 0, Vec::new(), &op);
        let err = ChainState::new().apply_block(&cfg, &b).unwrap_err();
        assert!(err.to_string().contains("does not follow tip"));
    }

    #[test]
    fn transfer_pays_fee_to_proposer() {
        let op = Ed25519Signer::generate();
        let cfg = test_config(&op);
        let (mut state, _) = genesis(&cfg, &op);
        let bob = Ed25519Signer::generate();

        let tx = Transaction::transfer(bob.address(), 5 * SCALE, 2_000, 1, 1, &op);
        let b1 = next_block(&state, &cfg, vec![tx], &op);
        let applied = state.apply_block(&cfg, &b1).unwrap();

        assert_eq!(state.balances[&bob.address()], 5 * SCALE);
        assert_eq!(state.nonces[&op.address()], 1);
        assert_eq!(applied.fees, 2_000);
        // fee goes back to the proposer, so only the transfer leaves
        assert_eq!(state.balances[&op.address()], 42 * SCALE - 5 * SCALE);
        assert!(state.is_conserved());
    }

    #[test]
    fn failing_transaction_reverts_whole_block() {
        let op = Ed25519Signer::generate();
        let cfg = test_config(&op);
        let (mut state, _) = genesis(&cfg, &op);
        let before = state.clone();
        let bob = Ed25519Signer::generate();

        let ok = Transaction::transfer(bob.address(), SCALE, 2_000, 1, 1, &op);
        let broke = Transaction::transfer(op.address(), SCALE, 2_000, 1, 1, &bob);
        let b1 = next_block(&state, &cfg, vec![ok, broke], &op);
        assert!(state.apply_block(&cfg, &b1).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn wrong_reward_rejected() {
        let op = Ed25519Signer::generate();
        let cfg = test_config(&op);
        let (mut state, g) = genesis(&cfg, &op);
        let b1 = Block::build(1, Some(g.hash), 1, 0, 22 * SCALE, Vec::new(), &op);
        let err = state.apply_block(&cfg, &b1).unwrap_err();
        assert!(err.to_string().contains("reward mismatch"));
    }

    #[test]
    fn bootstrap_rejects_foreign_proposer() {
        let op = Ed25519Signer::generate();
        let cfg = test_config(&op);
        let (mut state, _) = genesis(&cfg, &op);
        let stranger = Ed25519Signer::generate();
        let b1 = next_block(&state, &cfg, Vec::new(), &stranger);
        let err = state.apply_block(&cfg, &b1).unwrap_err();
        assert!(err.to_string().contains("expected"));
    }
}
