//! Persistence boundary.
//!
//! The core needs append, positional read, flush and index read/rewrite for
//! blocks, a keyed store for accepted double-sign evidence, plus keyed
//! stores for checkpoints and the mempool. [`ChainDb`]
//! implements them on LMDB; [`MemoryStorage`] is the in-process fake used by
//! tests and ephemeral nodes.
//!
//! [`ChainDb`]: crate::db::ChainDb

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::Block;
use crate::checkpoint::{Checkpoint, CheckpointMeta};
use crate::consensus::EvidenceRecord;
use crate::mempool::PersistedTx;
use crate::types::{Address, Hash};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("lmdb: {0}")]
    Lmdb(#[from] lmdb::Error),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes cannot be trusted.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Index record for one stored block (canonical or not).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub hash: Hash,
    pub height: u64,
    pub parent: Option<Hash>,
    /// Position in the block log.
    pub position: u64,
}

/// Index as persisted: every known block plus the canonical height -> hash list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredIndex {
    pub entries: Vec<IndexEntry>,
    /// `canonical[h]` is the hash of the canonical block at height `h`.
    pub canonical: Vec<Hash>,
}

/// Append-only block log plus its height/hash index.
pub trait BlockStorage: Debug + Send + Sync + 'static {
    /// Append `block` to the log and index it. When `canonical` is true the
    /// block also becomes the canonical block at its height (the new tip).
    /// Log append and index update are one unit.
    fn append_block(&self, block: &Block, canonical: bool) -> Result<IndexEntry, StorageError>;

    /// Positional read from the log.
    fn read_block(&self, position: u64) -> Result<Option<Block>, StorageError>;

    /// Number of records in the log.
    fn log_len(&self) -> Result<u64, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;

    fn load_index(&self) -> Result<StoredIndex, StorageError>;

    /// Drop canonical heights `>= from_height`, then append `hashes` from
    /// `from_height` upward. Used by reorg and checkpoint restore.
    fn write_canonical(&self, from_height: u64, hashes: &[Hash]) -> Result<(), StorageError>;

    /// Overwrite the whole index (after a rebuild from the log).
    fn replace_index(&self, index: &StoredIndex) -> Result<(), StorageError>;

    /// Insert or overwrite an evidence record (keyed by its id).
    fn put_evidence(&self, record: &EvidenceRecord) -> Result<(), StorageError>;

    /// All evidence records, in acceptance order.
    fn load_evidence(&self) -> Result<Vec<EvidenceRecord>, StorageError>;

    /// Wipe log, index and evidence.
    fn reset(&self) -> Result<(), StorageError>;
}

pub trait CheckpointStorage: Debug + Send + Sync + 'static {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;
    fn load_checkpoint(&self, id: u64) -> Result<Option<Checkpoint>, StorageError>;
    fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>, StorageError>;
    fn delete_checkpoint(&self, id: u64) -> Result<(), StorageError>;
}

/// Pool contents and per-sender nonce high-watermarks.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub txs: Vec<PersistedTx>,
    pub watermarks: Vec<(Address, u64)>,
}

pub trait MempoolStorage: Debug + Send + Sync + 'static {
    fn put_pool_tx(&self, entry: &PersistedTx) -> Result<(), StorageError>;
    fn delete_pool_tx(&self, hash: &Hash) -> Result<(), StorageError>;
    fn put_nonce_watermark(&self, address: &Address, nonce: u64) -> Result<(), StorageError>;
    fn load_pool(&self) -> Result<PoolSnapshot, StorageError>;
}

// ════════════════════════════════════════════════════════════════════════════
// IN-MEMORY FAKE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct MemoryInner {
    log: Vec<Block>,
    entries: HashMap<Hash, IndexEntry>,
    canonical: Vec<Hash>,
    evidence: HashMap<Hash, EvidenceRecord>,
    checkpoints: BTreeMap<u64, Checkpoint>,
    pool: HashMap<Hash, PersistedTx>,
    watermarks: HashMap<Address, u64>,
}

/// Volatile storage with the same semantics as the LMDB backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: overwrite a canonical index slot.
    pub fn tamper_canonical(&self, height: u64, hash: Hash) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.canonical.get_mut(height as usize) {
            *slot = hash;
        }
    }

    /// Fault injection: forget every index entry.
    pub fn drop_index_entries(&self) {
        self.inner.write().entries.clear();
    }
}

impl BlockStorage for MemoryStorage {
    fn append_block(&self, block: &Block, canonical: bool) -> Result<IndexEntry, StorageError> {
        let mut inner = self.inner.write();
        let entry = IndexEntry {
            hash: block.hash,
            height: block.header.height,
            parent: block.header.previous_hash,
            position: inner.log.len() as u64,
        };
        if canonical && inner.canonical.len() as u64 != block.header.height {
            return Err(StorageError::Corrupt(format!(
                "canonical append at height {} but tip is {}",
                block.header.height,
                inner.canonical.len()
            )));
        }
        inner.log.push(block.clone());
        inner.entries.insert(block.hash, entry.clone());
        if canonical {
            inner.canonical.push(block.hash);
        }
        Ok(entry)
    }

    fn read_block(&self, position: u64) -> Result<Option<Block>, StorageError> {
        Ok(self.inner.read().log.get(position as usize).cloned())
    }

    fn log_len(&self) -> Result<u64, StorageError> {
        Ok(self.inner.read().log.len() as u64)
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn load_index(&self) -> Result<StoredIndex, StorageError> {
        let inner = self.inner.read();
        let mut entries: Vec<IndexEntry> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.position);
        Ok(StoredIndex { entries, canonical: inner.canonical.clone() })
    }

    fn write_canonical(&self, from_height: u64, hashes: &[Hash]) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if from_height as usize > inner.canonical.len() {
            return Err(StorageError::Corrupt(format!(
                "canonical rewrite from {} past tip {}",
                from_height,
                inner.canonical.len()
            )));
        }
        inner.canonical.truncate(from_height as usize);
        inner.canonical.extend_from_slice(hashes);
        Ok(())
    }

    fn replace_index(&self, index: &StoredIndex) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        inner.entries = index.entries.iter().map(|e| (e.hash, e.clone())).collect();
        inner.canonical = index.canonical.clone();
        Ok(())
    }

    fn put_evidence(&self, record: &EvidenceRecord) -> Result<(), StorageError> {
        self.inner.write().evidence.insert(record.id, record.clone());
        Ok(())
    }

    fn load_evidence(&self) -> Result<Vec<EvidenceRecord>, StorageError> {
        let mut out: Vec<EvidenceRecord> = self.inner.read().evidence.values().cloned().collect();
        out.sort_by_key(|r| r.seq);
        Ok(out)
    }

    fn reset(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        inner.log.clear();
        inner.entries.clear();
        inner.canonical.clear();
        inner.evidence.clear();
        Ok(())
    }
}

impl CheckpointStorage for MemoryStorage {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.inner.write().checkpoints.insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    fn load_checkpoint(&self, id: u64) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.inner.read().checkpoints.get(&id).cloned())
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>, StorageError> {
        Ok(self.inner.read().checkpoints.values().map(Checkpoint::meta).collect())
    }

    fn delete_checkpoint(&self, id: u64) -> Result<(), StorageError> {
        self.inner.write().checkpoints.remove(&id);
        Ok(())
    }
}

impl MempoolStorage for MemoryStorage {
    fn put_pool_tx(&self, entry: &PersistedTx) -> Result<(), StorageError> {
        self.inner.write().pool.insert(entry.tx.hash, entry.clone());
        Ok(())
    }

    fn delete_pool_tx(&self, hash: &Hash) -> Result<(), StorageError> {
        self.inner.write().pool.remove(hash);
        Ok(())
    }

    fn put_nonce_watermark(&self, address: &Address, nonce: u64) -> Result<(), StorageError> {
        self.inner.write().watermarks.insert(*address, nonce);
        Ok(())
    }

    fn load_pool(&self) -> Result<PoolSnapshot, StorageError> {
        let inner = self.inner.read();
        Ok(PoolSnapshot {
            txs: inner.pool.values().cloned().collect(),
            watermarks: inner.watermarks.iter().map(|(a, n)| (*a, *n)).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519Signer, KeySigner};

    #[test]
    fn canonical_append_must_follow_tip() {
        let op = Ed25519Signer::generate();
        let store = MemoryStorage::new();
        let g = Block::genesis(0, 1, &op);
        let e = store.append_block(&g, true).unwrap();
        assert_eq!(e.position, 0);

        let skip = Block::build(2, Some(g.hash), 1, 0, 1, Vec::new(), &op);
        assert!(store.append_block(&skip, true).is_err());
        // side blocks are fine at any height
        store.append_block(&skip, false).unwrap();
        assert_eq!(store.log_len().unwrap(), 2);
        assert_eq!(store.load_index().unwrap().canonical, vec![g.hash]);
    }

    #[test]
    fn write_canonical_truncates_then_extends() {
        let op = Ed25519Signer::generate();
        let store = MemoryStorage::new();
        let g = Block::genesis(0, 1, &op);
        let b1 = Block::build(1, Some(g.hash), 1, 0, 1, Vec::new(), &op);
        let b1b = Block::build(1, Some(g.hash), 2, 0, 1, Vec::new(), &op);
        store.append_block(&g, true).unwrap();
        store.append_block(&b1, true).unwrap();
        store.append_block(&b1b, false).unwrap();

        store.write_canonical(1, &[b1b.hash]).unwrap();
        assert_eq!(store.load_index().unwrap().canonical, vec![g.hash, b1b.hash]);
        assert!(store.write_canonical(5, &[]).is_err());
    }

    #[test]
    fn evidence_loads_in_acceptance_order_and_reset_clears_it() {
        use crate::consensus::DoubleSignEvidence;

        let op = Ed25519Signer::generate();
        let store = MemoryStorage::new();
        let record = |seq: u64, ts: u64| {
            let a = Block::build(3, None, ts, 0, 1, Vec::new(), &op);
            let b = Block::build(3, None, ts + 1, 0, 1, Vec::new(), &op);
            let evidence = DoubleSignEvidence::new(&a, &b);
            EvidenceRecord { id: evidence.id(), seq, offender: op.address(), height: 3, evidence }
        };
        let late = record(1, 500);
        let early = record(0, 100);
        store.put_evidence(&late).unwrap();
        store.put_evidence(&early).unwrap();

        // overwrite keeps one entry per id
        let moved = EvidenceRecord { height: 9, ..late.clone() };
        store.put_evidence(&moved).unwrap();
        assert_eq!(store.load_evidence().unwrap(), vec![early, moved]);

        store.reset().unwrap();
        assert!(store.load_evidence().unwrap().is_empty());
    }
}
