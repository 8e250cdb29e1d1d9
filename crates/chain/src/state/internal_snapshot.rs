//! Full ledger capture for checkpoints.

use serde::{Deserialize, Serialize};

use crate::error::ConsistencyError;
use crate::types::Hash;

use super::ChainState;

/// Ledger copy plus the state root it had when taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub height: u64,
    pub tip_hash: Option<Hash>,
    pub state_root: Hash,
    pub state: ChainState,
}

impl ChainState {
    pub fn create_state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            height: self.height,
            tip_hash: self.tip_hash,
            state_root: self.compute_state_root(),
            state: self.clone(),
        }
    }

    /// Replace the whole ledger with `snapshot` after checking its root.
    /// On error `self` is left untouched.
    pub fn restore_state_snapshot(&mut self, snapshot: &StateSnapshot) -> Result<(), ConsistencyError> {
        snapshot.verify()?;
        *self = snapshot.state.clone();
        Ok(())
    }
}

impl StateSnapshot {
    pub fn verify(&self) -> Result<(), ConsistencyError> {
        if self.state.height != self.height || self.state.tip_hash != self.tip_hash {
            return Err(ConsistencyError::LedgerMismatch(format!(
                "snapshot header says height {} but ledger is at {}",
                self.height, self.state.height
            )));
        }
        if self.state.compute_state_root() != self.state_root {
            return Err(ConsistencyError::LedgerMismatch(format!(
                "state root mismatch at height {}",
                self.height
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, SCALE};

    #[test]
    fn tampered_snapshot_rejected() {
        let mut s = ChainState::new();
        s.balances.insert(Address::from_bytes([1; 20]), 10 * SCALE);
        s.total_minted = 10 * SCALE;
        let mut snap = s.create_state_snapshot();

        let mut target = ChainState::new();
        target.restore_state_snapshot(&snap).unwrap();
        assert_eq!(target, s);

        snap.state.balances.insert(Address::from_bytes([1; 20]), 11 * SCALE);
        let mut untouched = ChainState::new();
        assert!(untouched.restore_state_snapshot(&snap).is_err());
        assert_eq!(untouched, ChainState::new());
    }
}
