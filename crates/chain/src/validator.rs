//! Validator record and lifecycle state machine.
//!
//! ```text
//!            stake >= min              missed threshold / evidence
//!  Inactive ───────────────► Active ─────────────────────────────► Jailed
//!     ▲   ◄───────────────   │  ▲                                    │
//!     │      stake < min     │  └──── unjail (after jailed_until) ───┘
//!     │                      │
//!     └──────────┬───────────┘
//!                ▼ double-sign
//!           Tombstoned (terminal)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::types::{Address, Amount};

pub const REPUTATION_MIN: u32 = 0;
pub const REPUTATION_MAX: u32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidatorStatus {
    Active,
    Inactive,
    Jailed,
    Tombstoned,
}

impl ValidatorStatus {
    /// The transition table. Anything not listed here is rejected.
    pub fn can_transition_to(self, to: ValidatorStatus) -> bool {
        use ValidatorStatus::*;
        matches!(
            (self, to),
            (Active, Inactive)
                | (Active, Jailed)
                | (Active, Tombstoned)
                | (Inactive, Active)
                | (Inactive, Tombstoned)
                | (Jailed, Active)
                | (Jailed, Inactive)
                | (Jailed, Tombstoned)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ValidatorStatus::Tombstoned
    }
}

impl std::fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValidatorStatus::Active => "active",
            ValidatorStatus::Inactive => "inactive",
            ValidatorStatus::Jailed => "jailed",
            ValidatorStatus::Tombstoned => "tombstoned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub stake: Amount,
    pub reputation: u32,
    pub status: ValidatorStatus,
    /// Consecutive missed slots; reset when the validator produces a block.
    pub missed_blocks: u64,
    pub produced_blocks: u64,
    /// Unix ms.
    pub jailed_until: Option<u64>,
    pub distribution_reward_claimed: bool,
}

impl Validator {
    pub fn new(address: Address, initial_reputation: u32) -> Self {
        Self {
            address,
            stake: 0,
            reputation: initial_reputation.min(REPUTATION_MAX),
            status: ValidatorStatus::Inactive,
            missed_blocks: 0,
            produced_blocks: 0,
            jailed_until: None,
            distribution_reward_claimed: false,
        }
    }

    /// Move to `to` if the table allows it.
    pub fn transition(&mut self, to: ValidatorStatus) -> Result<ValidatorStatus, StateError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition { address: self.address, from, to });
        }
        self.status = to;
        Ok(from)
    }

    /// Proposer selection weight: `stake * (1000 + reputation) / 1000`.
    ///
    /// Reputation 0 keeps the plain stake weight, reputation 1000 doubles it.
    pub fn selection_weight(&self) -> u128 {
        let rep = self.reputation.min(REPUTATION_MAX) as u128;
        let bonus = self.stake / REPUTATION_MAX as u128 * rep
            + (self.stake % REPUTATION_MAX as u128) * rep / REPUTATION_MAX as u128;
        self.stake.saturating_add(bonus)
    }

    pub fn is_eligible(&self, min_stake: Amount) -> bool {
        self.status == ValidatorStatus::Active && self.stake >= min_stake
    }

    /// Returns the gain actually applied.
    pub fn raise_reputation(&mut self, by: u32) -> u32 {
        let before = self.reputation;
        self.reputation = self.reputation.saturating_add(by).min(REPUTATION_MAX);
        self.reputation - before
    }

    /// Returns the penalty actually applied.
    pub fn lower_reputation(&mut self, by: u32) -> u32 {
        let before = self.reputation;
        self.reputation = self.reputation.saturating_sub(by).max(REPUTATION_MIN);
        before - self.reputation
    }
}
