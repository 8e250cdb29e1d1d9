//! Balances, nonces and per-transaction application.

use crate::config::ChainConfig;
use crate::error::StateError;
use crate::tx::{Transaction, TxKind};
use crate::types::{Address, Amount, Hash};
use crate::utxo::UtxoOp;
use crate::validator::ValidatorStatus;

use super::{ChainState, Effects, LedgerOp};

impl ChainState {
    pub fn balance_of(&self, address: &Address) -> Amount {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn nonce_of(&self, address: &Address) -> u64 {
        self.nonces.get(address).copied().unwrap_or(0)
    }

    pub fn stake_of(&self, address: &Address) -> Amount {
        self.validators.get(address).map(|v| v.stake).unwrap_or(0)
    }

    /// `tx.nonce` must be exactly `current + 1`.
    pub fn check_nonce(&self, tx: &Transaction) -> Result<(), StateError> {
        let current = self.nonce_of(&tx.sender);
        if tx.nonce <= current {
            return Err(StateError::StaleNonce { address: tx.sender, nonce: tx.nonce, current });
        }
        let expected = current.saturating_add(1);
        if tx.nonce > expected {
            return Err(StateError::FutureNonce { address: tx.sender, nonce: tx.nonce, expected });
        }
        Ok(())
    }

    /// Ledger checks for `tx` without mutating anything.
    pub fn check_transaction(&self, cfg: &ChainConfig, tx: &Transaction, now_ms: u64) -> Result<(), StateError> {
        self.check_nonce(tx)?;
        let needed = tx.total_debit().ok_or(StateError::Overflow("amount + fee"))?;
        let available = self.balance_of(&tx.sender);
        if available < needed {
            return Err(StateError::InsufficientBalance { address: tx.sender, needed, available });
        }
        match tx.kind {
            TxKind::Transfer => {}
            TxKind::Stake => {
                if let Some(v) = self.validators.get(&tx.sender) {
                    if v.status == ValidatorStatus::Tombstoned {
                        return Err(StateError::InvalidTransition {
                            address: tx.sender,
                            from: ValidatorStatus::Tombstoned,
                            to: ValidatorStatus::Active,
                        });
                    }
                }
            }
            TxKind::Unstake => {
                let available = self.stake_of(&tx.sender);
                if available < tx.amount {
                    return Err(StateError::InsufficientStake { address: tx.sender, needed: tx.amount, available });
                }
            }
            TxKind::Unjail => {
                self.unjail_target(cfg, &tx.sender, now_ms)?;
            }
        }
        Ok(())
    }

    /// Apply one transaction inside a block.
    ///
    /// ## Arguments
    /// * `proposer` - receives the fee
    /// * `block_ts` - block timestamp, used for unjail eligibility
    pub(crate) fn apply_transaction(
        &mut self,
        cfg: &ChainConfig,
        fx: &mut Effects,
        tx: &Transaction,
        proposer: &Address,
        block_ts: u64,
    ) -> Result<(), StateError> {
        // every check up front; the mutations below cannot fail halfway
        self.check_transaction(cfg, tx, block_ts)?;

        let txid = tx.hash;
        match tx.kind {
            TxKind::Transfer => {
                self.debit(fx, txid, &tx.sender, tx.amount.saturating_add(tx.fee))?;
                self.credit(fx, txid, &tx.recipient, tx.amount);
            }
            TxKind::Stake => {
                self.debit(fx, txid, &tx.sender, tx.fee)?;
                self.update_account_stake(cfg, fx, txid, &tx.sender, to_delta(tx.amount)?)?;
            }
            TxKind::Unstake => {
                self.update_account_stake(cfg, fx, txid, &tx.sender, -to_delta(tx.amount)?)?;
                self.debit(fx, txid, &tx.sender, tx.fee)?;
            }
            TxKind::Unjail => {
                self.debit(fx, txid, &tx.sender, tx.fee)?;
                self.unjail(cfg, fx, &tx.sender, block_ts)?;
            }
        }
        self.credit(fx, txid, proposer, tx.fee);
        self.set_nonce(fx, &tx.sender, tx.nonce);
        Ok(())
    }

    /// Apply `tx` to a scratch ledger while assembling a block. The journal
    /// is discarded; a rejected `tx` leaves the ledger untouched.
    pub(crate) fn apply_for_proposal(
        &mut self,
        cfg: &ChainConfig,
        tx: &Transaction,
        proposer: &Address,
        block_ts: u64,
    ) -> Result<(), StateError> {
        let mut fx = Effects::default();
        self.apply_transaction(cfg, &mut fx, tx, proposer, block_ts)
    }

    // ────────────────────────────────────────────────────────────────────────
    // journaled primitives
    // ────────────────────────────────────────────────────────────────────────

    pub(crate) fn credit(&mut self, fx: &mut Effects, txid: Hash, address: &Address, amount: Amount) {
        if amount == 0 {
            return;
        }
        let bal = self.balances.entry(*address).or_insert(0);
        *bal = bal.saturating_add(amount);
        fx.ops.push(LedgerOp::Credited { address: *address, amount });
        fx.utxo.push(UtxoOp::Create { txid, owner: *address, amount });
    }

    pub(crate) fn debit(
        &mut self,
        fx: &mut Effects,
        txid: Hash,
        address: &Address,
        amount: Amount,
    ) -> Result<(), StateError> {
        if amount == 0 {
            return Ok(());
        }
        let available = self.balance_of(address);
        if available < amount {
            return Err(StateError::InsufficientBalance { address: *address, needed: amount, available });
        }
        self.set_balance(address, available - amount);
        fx.ops.push(LedgerOp::Debited { address: *address, amount });
        fx.utxo.push(UtxoOp::Spend { txid, owner: *address, amount });
        Ok(())
    }

    pub(crate) fn set_nonce(&mut self, fx: &mut Effects, address: &Address, nonce: u64) {
        let previous = self.nonce_of(address);
        self.nonces.insert(*address, nonce);
        fx.ops.push(LedgerOp::NonceSet { address: *address, previous });
    }

    pub(crate) fn set_balance(&mut self, address: &Address, value: Amount) {
        if value == 0 {
            self.balances.remove(address);
        } else {
            self.balances.insert(*address, value);
        }
    }
}

fn to_delta(amount: Amount) -> Result<i128, StateError> {
    i128::try_from(amount).map_err(|_| StateError::Overflow("stake amount"))
}
