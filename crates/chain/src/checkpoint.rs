//! Checkpoints: a verified copy of ledger and UTXO index at a canonical block.
//!
//! A checkpoint is the recovery point for deep reorganizations and for
//! startup after a crash. Restoring one rewinds block store, ledger and UTXO
//! index together (see `BlockStore::restore_from_checkpoint`); this module only
//! builds, verifies, stores and retires them.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::CheckpointConfig;
use crate::crypto::sha3_512;
use crate::error::{ChainResult, ConsistencyError};
use crate::state::{ChainState, StateSnapshot};
use crate::storage::{CheckpointStorage, StorageError};
use crate::types::Hash;
use crate::utxo::{UtxoIndex, UtxoSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: u64,
    pub height: u64,
    pub tip_hash: Hash,
    /// Unix ms.
    pub created_at: u64,
    pub digest: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    pub height: u64,
    pub tip_hash: Hash,
    pub created_at: u64,
    pub ledger: StateSnapshot,
    pub utxo: UtxoSnapshot,
    /// SHA3-512 over the bincode encoding of every other field.
    pub digest: Hash,
}

#[derive(Serialize)]
struct DigestInput<'a> {
    id: u64,
    height: u64,
    tip_hash: &'a Hash,
    created_at: u64,
    ledger: &'a StateSnapshot,
    utxo: &'a UtxoSnapshot,
}

impl Checkpoint {
    /// Capture `ledger` and `utxo` at the ledger tip.
    pub fn capture(id: u64, created_at: u64, ledger: &ChainState, utxo: &UtxoIndex) -> ChainResult<Self> {
        let tip_hash = ledger.tip_hash.ok_or_else(|| {
            ConsistencyError::NoRecoveryPoint("cannot checkpoint before genesis".to_string())
        })?;
        let mut cp = Checkpoint {
            id,
            height: ledger.height,
            tip_hash,
            created_at,
            ledger: ledger.create_state_snapshot(),
            utxo: utxo.snapshot(),
            digest: Hash::ZERO,
        };
        cp.digest = cp.compute_digest()?;
        Ok(cp)
    }

    pub fn compute_digest(&self) -> Result<Hash, StorageError> {
        let bytes = bincode::serialize(&DigestInput {
            id: self.id,
            height: self.height,
            tip_hash: &self.tip_hash,
            created_at: self.created_at,
            ledger: &self.ledger,
            utxo: &self.utxo,
        })?;
        Ok(sha3_512(&bytes))
    }

    pub fn meta(&self) -> CheckpointMeta {
        CheckpointMeta {
            id: self.id,
            height: self.height,
            tip_hash: self.tip_hash,
            created_at: self.created_at,
            digest: self.digest,
        }
    }

    /// Digest, ledger snapshot root, and agreement between header and payload.
    pub fn verify(&self) -> Result<(), ConsistencyError> {
        let integrity = |reason: String| ConsistencyError::CheckpointIntegrity { id: self.id, reason };
        let digest = self.compute_digest().map_err(|e| integrity(e.to_string()))?;
        if digest != self.digest {
            return Err(integrity("digest mismatch".to_string()));
        }
        if self.ledger.height != self.height || self.ledger.tip_hash != Some(self.tip_hash) {
            return Err(integrity(format!(
                "ledger snapshot at {} does not match checkpoint height {}",
                self.ledger.height, self.height
            )));
        }
        self.ledger.verify().map_err(|e| integrity(e.to_string()))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MANAGER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct CheckpointManager {
    storage: Arc<dyn CheckpointStorage>,
    config: CheckpointConfig,
    next_id: Mutex<u64>,
}

impl CheckpointManager {
    pub fn new(storage: Arc<dyn CheckpointStorage>, config: CheckpointConfig) -> ChainResult<Self> {
        let next = storage.list_checkpoints()?.iter().map(|m| m.id + 1).max().unwrap_or(0);
        Ok(Self { storage, config, next_id: Mutex::new(next) })
    }

    /// Whether the automatic schedule asks for a checkpoint at `height`.
    pub fn is_due(&self, height: u64) -> bool {
        let interval = self.config.interval_blocks;
        interval > 0 && height > 0 && height % interval == 0
    }

    /// Capture, persist, then apply retention.
    pub fn create_checkpoint(&self, ledger: &ChainState, utxo: &UtxoIndex, now_ms: u64) -> ChainResult<CheckpointMeta> {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let cp = Checkpoint::capture(id, now_ms, ledger, utxo)?;
        self.storage.save_checkpoint(&cp)?;
        info!(id, height = cp.height, tip = %cp.tip_hash.short(), "checkpoint created");
        self.cleanup_old_checkpoints(self.config.max_checkpoints)?;
        Ok(cp.meta())
    }

    /// All stored checkpoints, oldest height first.
    pub fn list(&self) -> ChainResult<Vec<CheckpointMeta>> {
        let mut metas = self.storage.list_checkpoints()?;
        metas.sort_by_key(|m| (m.height, m.id));
        Ok(metas)
    }

    pub fn load(&self, id: u64) -> ChainResult<Option<Checkpoint>> {
        Ok(self.storage.load_checkpoint(id)?)
    }

    /// Highest verified checkpoint with height <= `target_height`.
    pub fn get_nearest_checkpoint(&self, target_height: u64) -> ChainResult<Option<Checkpoint>> {
        self.nearest_matching(target_height, |_| true)
    }

    /// Like [`Self::get_nearest_checkpoint`], restricted to metas accepted by
    /// `accept` (e.g. on the canonical chain). Checkpoints failing
    /// verification are skipped.
    pub fn nearest_matching(
        &self,
        target_height: u64,
        accept: impl Fn(&CheckpointMeta) -> bool,
    ) -> ChainResult<Option<Checkpoint>> {
        let mut metas = self.list()?;
        metas.retain(|m| m.height <= target_height && accept(m));
        for meta in metas.iter().rev() {
            let cp = match self.storage.load_checkpoint(meta.id)? {
                Some(cp) => cp,
                None => continue,
            };
            match cp.verify() {
                Ok(()) => return Ok(Some(cp)),
                Err(e) => error!(id = meta.id, height = meta.height, error = %e, "skipping corrupt checkpoint"),
            }
        }
        Ok(None)
    }

    /// Keep the newest `keep_count` checkpoints by height (never fewer than one).
    pub fn cleanup_old_checkpoints(&self, keep_count: usize) -> ChainResult<usize> {
        let keep_count = keep_count.max(1);
        let metas = self.list()?;
        if metas.len() <= keep_count {
            return Ok(0);
        }
        let delete_count = metas.len() - keep_count;
        for meta in metas.iter().take(delete_count) {
            self.storage.delete_checkpoint(meta.id)?;
            info!(id = meta.id, height = meta.height, "old checkpoint deleted");
        }
        Ok(delete_count)
    }

    /// Delete checkpoints whose tip is no longer canonical.
    pub fn prune_stale(&self, is_canonical: impl Fn(u64, &Hash) -> bool) -> ChainResult<Vec<u64>> {
        let mut removed = Vec::new();
        for meta in self.list()? {
            if !is_canonical(meta.height, &meta.tip_hash) {
                self.storage.delete_checkpoint(meta.id)?;
                warn!(id = meta.id, height = meta.height, "stale checkpoint pruned after reorg");
                removed.push(meta.id);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha3_512;
    use crate::storage::MemoryStorage;
    use crate::types::{Address, SCALE};

    fn ledger_at(height: u64) -> ChainState {
        let mut s = ChainState::new();
        s.height = height;
        s.tip_hash = Some(sha3_512(&height.to_le_bytes()));
        s.balances.insert(Address::from_bytes([1; 20]), height as u128 * SCALE);
        s.total_minted = height as u128 * SCALE;
        s
    }

    fn manager(max: usize) -> (Arc<MemoryStorage>, CheckpointManager) {
        let store = Arc::new(MemoryStorage::new());
        let cfg = CheckpointConfig { interval_blocks: 10, max_checkpoints: max, ..Default::default() };
        let mgr = CheckpointManager::new(store.clone(), cfg).unwrap();
        (store, mgr)
    }

    #[test]
    fn capture_verifies_and_detects_tamper() {
        let cp = Checkpoint::capture(0, 1, &ledger_at(5), &UtxoIndex::new()).unwrap();
        cp.verify().unwrap();

        let mut bad = cp.clone();
        bad.ledger.state.total_minted += 1;
        assert!(matches!(bad.verify(), Err(ConsistencyError::CheckpointIntegrity { .. })));
    }

    #[test]
    fn nearest_is_highest_at_or_below_target() {
        let (_, mgr) = manager(10);
        for h in [10, 20, 30] {
            mgr.create_checkpoint(&ledger_at(h), &UtxoIndex::new(), h).unwrap();
        }
        assert_eq!(mgr.get_nearest_checkpoint(25).unwrap().unwrap().height, 20);
        assert_eq!(mgr.get_nearest_checkpoint(30).unwrap().unwrap().height, 30);
        assert!(mgr.get_nearest_checkpoint(9).unwrap().is_none());
    }

    #[test]
    fn retention_keeps_newest() {
        let (_, mgr) = manager(2);
        for h in [10, 20, 30] {
            mgr.create_checkpoint(&ledger_at(h), &UtxoIndex::new(), h).unwrap();
        }
        let heights: Vec<u64> = mgr.list().unwrap().iter().map(|m| m.height).collect();
        assert_eq!(heights, vec![20, 30]);
        assert!(mgr.is_due(40));
        assert!(!mgr.is_due(41));
        assert!(!mgr.is_due(0));
    }

    #[test]
    fn prune_stale_removes_off_chain() {
        let (_, mgr) = manager(10);
        let keep = mgr.create_checkpoint(&ledger_at(10), &UtxoIndex::new(), 1).unwrap();
        mgr.create_checkpoint(&ledger_at(20), &UtxoIndex::new(), 2).unwrap();
        let removed = mgr.prune_stale(|h, _| h == keep.height).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(mgr.list().unwrap(), vec![keep]);
    }

    #[test]
    fn ids_continue_after_reopen() {
        let (store, mgr) = manager(10);
        mgr.create_checkpoint(&ledger_at(10), &UtxoIndex::new(), 1).unwrap();
        let reopened = CheckpointManager::new(store, CheckpointConfig::default()).unwrap();
        let meta = reopened.create_checkpoint(&ledger_at(20), &UtxoIndex::new(), 2).unwrap();
        assert_eq!(meta.id, 1);
    }
}
