//! Slot timing and proposer liveness.
//!
//! One slot per height. Round 0 opens `block_interval_ms` after the parent
//! block; the selected proposer then has `proposer_window_ms` to deliver.
//! When the window passes the proposer is charged a missed block and the
//! slot moves to the next round with a freshly selected proposer.

pub mod proposer;
pub mod slashing;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ChainConfig;
use crate::error::ConsensusError;
use crate::state::{ChainState, MissReport};
use crate::types::{Address, Hash};
use crate::validator::ValidatorStatus;

pub use proposer::{expected_proposer, selection_seed};
pub use slashing::{DoubleSignEvidence, EvidenceRecord, SignedHeader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub height: u64,
    pub parent_hash: Hash,
    pub round: u32,
    pub proposer: Address,
    /// Unix ms.
    pub started_at: u64,
    pub deadline: u64,
}

/// A proposer that let its window pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedSlot {
    pub slot: Slot,
    /// `None` when the proposer has no validator record (bootstrap operator).
    pub report: Option<MissReport>,
    /// Set when the miss jailed the proposer.
    pub status_change: Option<(ValidatorStatus, ValidatorStatus)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    /// Slot not open yet.
    Waiting(Slot),
    /// Inside the proposer window.
    Ready(Slot),
    /// Window expired; `next` is the following round, `None` when no
    /// proposer is left to select.
    Missed { missed: MissedSlot, next: Option<Slot> },
    /// No proposer can be selected; retry next interval.
    Paused(ConsensusError),
}

#[derive(Debug)]
pub struct ConsensusEngine {
    config: Arc<ChainConfig>,
    current: Option<Slot>,
}

impl ConsensusEngine {
    pub fn new(config: Arc<ChainConfig>) -> Self {
        Self { config, current: None }
    }

    pub fn current_slot(&self) -> Option<&Slot> {
        self.current.as_ref()
    }

    fn open_slot(&self, state: &ChainState, parent: Hash, round: u32, started_at: u64) -> Result<Slot, ConsensusError> {
        let height = state.height + 1;
        let proposer = expected_proposer(state, &self.config, &parent, height, round)?;
        Ok(Slot {
            height,
            parent_hash: parent,
            round,
            proposer,
            started_at,
            deadline: started_at.saturating_add(self.config.consensus.proposer_window_ms),
        })
    }

    /// Advance slot timing to `now_ms`.
    ///
    /// A miss mutates `state` directly (missed counter, reputation, jail).
    /// Those penalties are node-local observations and are not part of any
    /// block.
    pub fn poll(&mut self, state: &mut ChainState, now_ms: u64) -> SlotStatus {
        let parent = match state.tip_hash {
            Some(h) => h,
            None => return SlotStatus::Paused(ConsensusError::NoEligibleProposer(0)),
        };
        let height = state.height + 1;

        let stale = match &self.current {
            Some(slot) => slot.height != height || slot.parent_hash != parent,
            None => true,
        };
        if stale {
            let start = now_ms.max(state.last_block_timestamp.saturating_add(self.config.consensus.block_interval_ms));
            match self.open_slot(state, parent, 0, start) {
                Ok(slot) => {
                    debug!(height, proposer = %slot.proposer, "slot opened");
                    self.current = Some(slot);
                }
                Err(e) => {
                    self.current = None;
                    return SlotStatus::Paused(e);
                }
            }
        }

        let slot = match &self.current {
            Some(slot) => slot.clone(),
            None => return SlotStatus::Paused(ConsensusError::NoEligibleProposer(height)),
        };
        if now_ms < slot.started_at {
            return SlotStatus::Waiting(slot);
        }
        if now_ms < slot.deadline {
            return SlotStatus::Ready(slot);
        }

        let missed = self.charge_miss(state, slot, now_ms);
        match self.open_slot(state, parent, missed.slot.round.saturating_add(1), now_ms) {
            Ok(next) => {
                self.current = Some(next.clone());
                SlotStatus::Missed { missed, next: Some(next) }
            }
            Err(e) => {
                warn!(height, error = %e, "no proposer left for slot");
                self.current = None;
                SlotStatus::Missed { missed, next: None }
            }
        }
    }

    fn charge_miss(&self, state: &mut ChainState, slot: Slot, now_ms: u64) -> MissedSlot {
        let before = state.get_validator(&slot.proposer).map(|v| v.status);
        let report = match before {
            Some(_) => match state.record_missed_slot(&self.config, &slot.proposer, now_ms) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(proposer = %slot.proposer, error = %e, "could not record missed slot");
                    None
                }
            },
            None => None,
        };
        let after = state.get_validator(&slot.proposer).map(|v| v.status);
        let status_change = match (before, after) {
            (Some(b), Some(a)) if a != b => Some((b, a)),
            _ => None,
        };
        warn!(height = slot.height, round = slot.round, proposer = %slot.proposer, "proposer missed slot");
        MissedSlot { slot, report, status_change }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SCALE;
    use crate::validator::Validator;

    fn config() -> Arc<ChainConfig> {
        let mut cfg = ChainConfig::default();
        cfg.consensus.block_interval_ms = 1_000;
        cfg.consensus.proposer_window_ms = 500;
        cfg.consensus.missed_block_threshold = 2;
        Arc::new(cfg)
    }

    fn state_with(addrs: &[u8]) -> ChainState {
        let mut state = ChainState::new();
        state.tip_hash = Some(Hash::from_bytes([1; 64]));
        state.last_block_timestamp = 10_000;
        for b in addrs {
            let addr = Address::from_bytes([*b; 20]);
            let mut v = Validator::new(addr, 500);
            v.stake = 100 * SCALE;
            v.status = ValidatorStatus::Active;
            state.validators.insert(addr, v);
        }
        state
    }

    #[test]
    fn slot_waits_then_opens() {
        let mut engine = ConsensusEngine::new(config());
        let mut state = state_with(&[1]);
        assert!(matches!(engine.poll(&mut state, 10_500), SlotStatus::Waiting(_)));
        match engine.poll(&mut state, 11_000) {
            SlotStatus::Ready(slot) => {
                assert_eq!(slot.height, 1);
                assert_eq!(slot.round, 0);
                assert_eq!(slot.deadline, 11_500);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn expired_window_charges_proposer_and_advances_round() {
        let mut engine = ConsensusEngine::new(config());
        let mut state = state_with(&[1]);
        engine.poll(&mut state, 11_000);
        let status = engine.poll(&mut state, 11_600);
        let SlotStatus::Missed { missed, next } = status else {
            panic!("expected a miss");
        };
        let next = next.unwrap();
        assert_eq!(next.round, 1);
        assert_eq!(next.started_at, 11_600);
        assert_eq!(missed.report.unwrap().missed_blocks, 1);
        assert_eq!(state.validators[&missed.slot.proposer].reputation, 490);
    }

    #[test]
    fn repeated_misses_jail() {
        let mut engine = ConsensusEngine::new(config());
        let mut state = state_with(&[1]);
        engine.poll(&mut state, 11_000);
        engine.poll(&mut state, 11_600);
        let status = engine.poll(&mut state, 12_200);
        let SlotStatus::Missed { missed, next } = status else {
            panic!("expected a miss");
        };
        assert!(next.is_none());
        assert_eq!(missed.status_change, Some((ValidatorStatus::Active, ValidatorStatus::Jailed)));
        // the only validator is jailed and no operator is configured
        assert!(matches!(engine.poll(&mut state, 12_300), SlotStatus::Paused(_)));
    }

    #[test]
    fn new_tip_resets_round() {
        let mut engine = ConsensusEngine::new(config());
        let mut state = state_with(&[1, 2]);
        engine.poll(&mut state, 11_000);
        engine.poll(&mut state, 11_600);
        assert_eq!(engine.current_slot().unwrap().round, 1);

        state.height = 1;
        state.tip_hash = Some(Hash::from_bytes([2; 64]));
        state.last_block_timestamp = 11_700;
        let SlotStatus::Waiting(slot) = engine.poll(&mut state, 11_800) else {
            panic!("expected waiting");
        };
        assert_eq!((slot.height, slot.round), (2, 0));
    }

    #[test]
    fn no_genesis_pauses() {
        let mut engine = ConsensusEngine::new(config());
        let mut state = ChainState::new();
        assert!(matches!(engine.poll(&mut state, 0), SlotStatus::Paused(_)));
    }
}
