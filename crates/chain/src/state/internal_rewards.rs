//! Block reward and distribution-window bonuses.

use tracing::info;

use crate::block::Block;
use crate::config::ChainConfig;
use crate::error::{StateError, ValidationError};
use crate::tokenomics::{block_reward, capped_mint};
use crate::types::{Address, Amount, Hash};
use crate::utxo::coinbase_id;

use super::{BonusKind, ChainState, Effects, LedgerOp};

impl ChainState {
    /// Credit the scheduled reward to the block proposer.
    ///
    /// The header must carry exactly `block_reward(height, total_minted)`;
    /// the amount is zero once `max_supply` is reached.
    pub(crate) fn process_block_reward(
        &mut self,
        cfg: &ChainConfig,
        fx: &mut Effects,
        block: &Block,
    ) -> Result<Amount, ValidationError> {
        let height = block.height();
        let expected = block_reward(&cfg.reward, height, self.total_minted);
        if block.header.reward != expected {
            return Err(ValidationError::RewardMismatch { height, expected, got: block.header.reward });
        }
        self.mint(fx, coinbase_id(&block.hash), &block.header.proposer, expected);
        Ok(expected)
    }

    /// One-time bonus for the genesis operator's node while the window is open.
    pub(crate) fn award_developer_node_reward(
        &mut self,
        cfg: &ChainConfig,
        fx: &mut Effects,
        txid: Hash,
        address: &Address,
        now_ms: u64,
    ) -> Result<Amount, StateError> {
        let d = &cfg.distribution;
        if !d.is_open_at(now_ms) {
            return Err(StateError::DistributionClosed);
        }
        if self.developer_rewarded.contains(address) {
            return Err(StateError::AlreadyRewarded { address: *address });
        }
        let amount = capped_mint(&cfg.reward, d.developer_bonus, self.total_minted);
        if amount == 0 {
            return Err(StateError::SupplyExhausted);
        }
        self.developer_rewarded.insert(*address);
        fx.ops.push(LedgerOp::BonusClaimed { address: *address, kind: BonusKind::Developer });
        self.mint(fx, txid, address, amount);
        info!(node = %address, amount, "developer node bonus awarded");
        Ok(amount)
    }

    /// One-time bonus for each of the first `max_early_validators` validators
    /// activated inside the window.
    pub(crate) fn award_early_validator_reward(
        &mut self,
        cfg: &ChainConfig,
        fx: &mut Effects,
        txid: Hash,
        address: &Address,
        now_ms: u64,
    ) -> Result<Amount, StateError> {
        let d = &cfg.distribution;
        if !d.is_open_at(now_ms) {
            return Err(StateError::DistributionClosed);
        }
        let claimed = self.validators.get(address).map(|v| v.distribution_reward_claimed).unwrap_or(false);
        if claimed || self.early_rewarded.contains(address) {
            return Err(StateError::AlreadyRewarded { address: *address });
        }
        if self.early_rewarded.len() >= d.max_early_validators as usize {
            return Err(StateError::EarlySlotsExhausted);
        }
        let amount = capped_mint(&cfg.reward, d.early_validator_bonus, self.total_minted);
        if amount == 0 {
            return Err(StateError::SupplyExhausted);
        }
        self.early_rewarded.insert(*address);
        if let Some(v) = self.validators.get_mut(address) {
            v.distribution_reward_claimed = true;
        }
        fx.ops.push(LedgerOp::BonusClaimed { address: *address, kind: BonusKind::EarlyValidator });
        self.mint(fx, txid, address, amount);
        info!(validator = %address, amount, "early validator bonus awarded");
        Ok(amount)
    }

    fn mint(&mut self, fx: &mut Effects, txid: Hash, address: &Address, amount: Amount) {
        if amount == 0 {
            return;
        }
        self.total_minted = self.total_minted.saturating_add(amount);
        fx.ops.push(LedgerOp::Minted { amount });
        self.credit(fx, txid, address, amount);
    }
}
