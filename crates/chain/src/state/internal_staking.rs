//! Stake movement and validator lifecycle effects.
//!
//! Stake and balance live on the same account: staking debits the balance,
//! unstaking credits it. Crossing `min_stake` toggles Active/Inactive;
//! Jailed and Tombstoned validators are never toggled by stake changes.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ChainConfig;
use crate::error::StateError;
use crate::types::{Address, Amount, Hash, TREASURY_ADDRESS};
use crate::validator::{Validator, ValidatorStatus, REPUTATION_MIN};

use super::{ChainState, Effects, LedgerOp};

/// Outcome of a missed proposer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissReport {
    pub missed_blocks: u64,
    pub reputation: u32,
    pub jailed_until: Option<u64>,
}

/// One enforced double-sign penalty and what it replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashRecord {
    pub offender: Address,
    /// Acceptance order of the evidence.
    pub seq: u64,
    /// Ledger height the penalty was enforced at.
    pub height: u64,
    pub amount: Amount,
    pub previous_status: ValidatorStatus,
    pub previous_reputation: u32,
    pub previous_jailed_until: Option<u64>,
    /// The offender had no record on this chain; lifting removes it again.
    pub created: bool,
}

/// Outcome of a double-sign penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlashReport {
    pub slashed: Amount,
    pub previous_status: ValidatorStatus,
    pub remaining_stake: Amount,
}

impl ChainState {
    /// Move `delta` between balance and stake of `address`.
    ///
    /// Positive `delta` stakes (balance -> stake), negative unstakes.
    pub(crate) fn update_account_stake(
        &mut self,
        cfg: &ChainConfig,
        fx: &mut Effects,
        txid: Hash,
        address: &Address,
        delta: i128,
    ) -> Result<(), StateError> {
        let amount = delta.unsigned_abs();
        if amount == 0 {
            return Ok(());
        }
        self.ensure_validator(cfg, fx, address);

        if delta > 0 {
            self.debit(fx, txid, address, amount)?;
            if let Some(v) = self.validators.get_mut(address) {
                v.stake = v.stake.saturating_add(amount);
            }
            fx.ops.push(LedgerOp::Staked { address: *address, amount });
        } else {
            let available = self.stake_of(address);
            if available < amount {
                return Err(StateError::InsufficientStake { address: *address, needed: amount, available });
            }
            if let Some(v) = self.validators.get_mut(address) {
                v.stake -= amount;
            }
            fx.ops.push(LedgerOp::Unstaked { address: *address, amount });
            self.credit(fx, txid, address, amount);
        }

        let (status, stake) = match self.validators.get(address) {
            Some(v) => (v.status, v.stake),
            None => return Ok(()),
        };
        let min = cfg.consensus.min_stake;
        match status {
            ValidatorStatus::Inactive if stake >= min => {
                self.set_status(fx, address, ValidatorStatus::Active)?;
                fx.activated.push(*address);
            }
            ValidatorStatus::Active if stake < min => {
                self.set_status(fx, address, ValidatorStatus::Inactive)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn ensure_validator(&mut self, cfg: &ChainConfig, fx: &mut Effects, address: &Address) {
        if !self.validators.contains_key(address) {
            self.validators
                .insert(*address, Validator::new(*address, cfg.consensus.initial_reputation));
            fx.ops.push(LedgerOp::ValidatorCreated { address: *address });
        }
    }

    /// Journaled status transition through the table.
    pub(crate) fn set_status(
        &mut self,
        fx: &mut Effects,
        address: &Address,
        to: ValidatorStatus,
    ) -> Result<(), StateError> {
        let v = self.validators.get_mut(address).ok_or(StateError::ValidatorNotFound(*address))?;
        let from = v.transition(to)?;
        fx.ops.push(LedgerOp::StatusChanged { address: *address, from, to });
        Ok(())
    }

    /// Proposer bookkeeping for an applied block.
    pub(crate) fn record_produced(&mut self, cfg: &ChainConfig, fx: &mut Effects, proposer: &Address) {
        if let Some(v) = self.validators.get_mut(proposer) {
            v.produced_blocks += 1;
            let missed_before = v.missed_blocks;
            v.missed_blocks = 0;
            let reputation_gain = v.raise_reputation(cfg.consensus.reputation_gain);
            fx.ops.push(LedgerOp::ProducedBlock { address: *proposer, reputation_gain, missed_before });
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // liveness
    // ────────────────────────────────────────────────────────────────────────

    /// Penalize a proposer that let its slot pass. Jails on reaching the
    /// missed-block threshold.
    pub fn record_missed_slot(
        &mut self,
        cfg: &ChainConfig,
        address: &Address,
        now_ms: u64,
    ) -> Result<MissReport, StateError> {
        let c = &cfg.consensus;
        let v = self.validators.get_mut(address).ok_or(StateError::ValidatorNotFound(*address))?;
        v.missed_blocks += 1;
        v.lower_reputation(c.reputation_penalty);

        if v.missed_blocks >= c.missed_block_threshold && v.status == ValidatorStatus::Active {
            v.transition(ValidatorStatus::Jailed)?;
            v.jailed_until = Some(now_ms.saturating_add(c.jail_duration_ms));
            warn!(
                validator = %address,
                missed = v.missed_blocks,
                until = now_ms.saturating_add(c.jail_duration_ms),
                "validator jailed for missed blocks"
            );
        }
        Ok(MissReport { missed_blocks: v.missed_blocks, reputation: v.reputation, jailed_until: v.jailed_until })
    }

    /// Status an unjail request for `address` would land in at `now_ms`.
    pub fn unjail_target(
        &self,
        cfg: &ChainConfig,
        address: &Address,
        now_ms: u64,
    ) -> Result<ValidatorStatus, StateError> {
        let v = self.validators.get(address).ok_or(StateError::ValidatorNotFound(*address))?;
        if v.status != ValidatorStatus::Jailed {
            return Err(StateError::InvalidTransition {
                address: *address,
                from: v.status,
                to: ValidatorStatus::Active,
            });
        }
        let until = v.jailed_until.unwrap_or(0);
        if now_ms < until {
            return Err(StateError::StillJailed { address: *address, until });
        }
        if v.stake >= cfg.consensus.min_stake {
            Ok(ValidatorStatus::Active)
        } else {
            Ok(ValidatorStatus::Inactive)
        }
    }

    pub(crate) fn unjail(
        &mut self,
        cfg: &ChainConfig,
        fx: &mut Effects,
        address: &Address,
        now_ms: u64,
    ) -> Result<(), StateError> {
        let target = self.unjail_target(cfg, address, now_ms)?;
        self.set_status(fx, address, target)?;
        if let Some(v) = self.validators.get_mut(address) {
            fx.ops.push(LedgerOp::Unjailed {
                address: *address,
                jailed_until: v.jailed_until,
                missed_blocks: v.missed_blocks,
            });
            v.jailed_until = None;
            v.missed_blocks = 0;
        }
        info!(validator = %address, status = %target, "validator unjailed");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // double-sign
    // ────────────────────────────────────────────────────────────────────────

    /// Reputation to the floor, slash `double_sign_slash_percent` of stake
    /// into the treasury, tombstone. No block reverts it.
    pub fn slash_double_sign(
        &mut self,
        cfg: &ChainConfig,
        evidence_id: Hash,
        seq: u64,
        address: &Address,
    ) -> Result<SlashReport, StateError> {
        let v = self.validators.get(address).ok_or(StateError::ValidatorNotFound(*address))?;
        if !v.status.can_transition_to(ValidatorStatus::Tombstoned) {
            return Err(StateError::InvalidTransition {
                address: *address,
                from: v.status,
                to: ValidatorStatus::Tombstoned,
            });
        }
        let report = self.tombstone(cfg, evidence_id, seq, address);
        warn!(validator = %address, slashed = report.slashed, "validator tombstoned for double-signing");
        Ok(report)
    }

    /// Enforce a stored penalty on a ledger rebuilt from blocks. An offender
    /// without a record on this chain gets a tombstoned one without stake.
    pub fn enforce_slash(&mut self, cfg: &ChainConfig, evidence_id: Hash, seq: u64, address: &Address) -> SlashReport {
        if let Some(r) = self.slashes.get(&evidence_id) {
            return SlashReport {
                slashed: r.amount,
                previous_status: r.previous_status,
                remaining_stake: self.stake_of(address),
            };
        }
        let report = self.tombstone(cfg, evidence_id, seq, address);
        debug!(validator = %address, slashed = report.slashed, height = self.height, "double-sign penalty enforced");
        report
    }

    fn tombstone(&mut self, cfg: &ChainConfig, evidence_id: Hash, seq: u64, address: &Address) -> SlashReport {
        let pct = cfg.consensus.double_sign_slash_percent as u128;
        let height = self.height;
        let created = !self.validators.contains_key(address);
        let v = self
            .validators
            .entry(*address)
            .or_insert_with(|| Validator::new(*address, REPUTATION_MIN));

        let previous_status = v.status;
        let record = SlashRecord {
            offender: *address,
            seq,
            height,
            amount: if previous_status == ValidatorStatus::Tombstoned {
                0
            } else {
                v.stake / 100 * pct + v.stake % 100 * pct / 100
            },
            previous_status,
            previous_reputation: v.reputation,
            previous_jailed_until: v.jailed_until,
            created,
        };
        v.status = ValidatorStatus::Tombstoned;
        v.reputation = REPUTATION_MIN;
        v.stake -= record.amount;
        v.jailed_until = None;
        let remaining_stake = v.stake;

        let slashed = record.amount;
        let treasury = self.balance_of(&TREASURY_ADDRESS);
        self.set_balance(&TREASURY_ADDRESS, treasury.saturating_add(slashed));
        self.slashes.insert(evidence_id, record);
        SlashReport { slashed, previous_status, remaining_stake }
    }

    /// Lift every penalty enforced at or above `height` in reverse order of
    /// enforcement (height, then seq) and restore what it replaced. Returns
    /// the lifted evidence ids.
    pub fn lift_slashes_from(&mut self, height: u64) -> Vec<Hash> {
        let mut lifted: Vec<(Hash, (u64, u64))> = self
            .slashes
            .iter()
            .filter(|(_, r)| r.height >= height)
            .map(|(id, r)| (*id, (r.height, r.seq)))
            .collect();
        lifted.sort_by_key(|(_, order)| Reverse(*order));
        lifted.into_iter().filter(|(id, _)| self.lift_slash(id)).map(|(id, _)| id).collect()
    }

    /// Lift one penalty. Returns false if it was not in force.
    pub fn lift_slash(&mut self, evidence_id: &Hash) -> bool {
        let r = match self.slashes.remove(evidence_id) {
            Some(r) => r,
            None => return false,
        };
        let treasury = self.balance_of(&TREASURY_ADDRESS);
        if treasury < r.amount {
            error!(evidence = %evidence_id.short(), "treasury below lifted slash");
        }
        self.set_balance(&TREASURY_ADDRESS, treasury.saturating_sub(r.amount));
        if r.created {
            self.validators.remove(&r.offender);
        } else if let Some(v) = self.validators.get_mut(&r.offender) {
            v.stake = v.stake.saturating_add(r.amount);
            v.status = r.previous_status;
            v.reputation = r.previous_reputation;
            v.jailed_until = r.previous_jailed_until;
        }
        true
    }
}
