//! LMDB backend for block log, index, checkpoints and mempool.
//!
//! ```text
//! block_log        u64 BE position -> bincode Block
//! block_index      hash (64 bytes)  -> bincode IndexEntry
//! canonical        u64 BE height    -> hash (64 bytes)
//! meta             "log_len" / "canonical_len" -> u64 BE
//! evidence         id (64 bytes)    -> bincode EvidenceRecord
//! checkpoints      u64 BE id        -> bincode Checkpoint
//! checkpoint_meta  u64 BE id        -> bincode CheckpointMeta
//! mempool          hash (64 bytes)  -> bincode PersistedTx
//! mempool_nonces   address (20)     -> u64 BE
//! ```
//!
//! Every write is a single LMDB transaction, so a block append and its
//! index update land together or not at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lmdb::{Cursor, Database, DatabaseFlags, Environment, RwTransaction, Transaction as LmdbTxn, WriteFlags};
use tracing::{debug, info};

use crate::block::Block;
use crate::checkpoint::{Checkpoint, CheckpointMeta};
use crate::consensus::EvidenceRecord;
use crate::mempool::PersistedTx;
use crate::storage::{
    BlockStorage, CheckpointStorage, IndexEntry, MempoolStorage, PoolSnapshot, StorageError, StoredIndex,
};
use crate::types::{Address, Hash};

const MAP_SIZE: usize = 1_000_000_000;
const KEY_LOG_LEN: &[u8] = b"log_len";
const KEY_CANONICAL_LEN: &[u8] = b"canonical_len";

#[derive(Clone)]
pub struct ChainDb {
    env: Arc<Environment>,
    env_path: PathBuf,
    db_block_log: Database,
    db_block_index: Database,
    db_canonical: Database,
    db_meta: Database,
    db_evidence: Database,
    db_checkpoints: Database,
    db_checkpoint_meta: Database,
    db_mempool: Database,
    db_mempool_nonces: Database,
}

impl std::fmt::Debug for ChainDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainDb").field("path", &self.env_path).finish()
    }
}

impl ChainDb {
    /// Open (or create) the environment at `path` and its named databases.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let p = path.as_ref();
        std::fs::create_dir_all(p)?;

        let env = Environment::new().set_max_dbs(9).set_map_size(MAP_SIZE).open(p)?;

        let db_block_log = env.create_db(Some("block_log"), DatabaseFlags::empty())?;
        let db_block_index = env.create_db(Some("block_index"), DatabaseFlags::empty())?;
        let db_canonical = env.create_db(Some("canonical"), DatabaseFlags::empty())?;
        let db_meta = env.create_db(Some("meta"), DatabaseFlags::empty())?;
        let db_evidence = env.create_db(Some("evidence"), DatabaseFlags::empty())?;
        let db_checkpoints = env.create_db(Some("checkpoints"), DatabaseFlags::empty())?;
        let db_checkpoint_meta = env.create_db(Some("checkpoint_meta"), DatabaseFlags::empty())?;
        let db_mempool = env.create_db(Some("mempool"), DatabaseFlags::empty())?;
        let db_mempool_nonces = env.create_db(Some("mempool_nonces"), DatabaseFlags::empty())?;

        info!(path = %p.display(), "chain database opened");
        Ok(Self {
            env: Arc::new(env),
            env_path: p.to_path_buf(),
            db_block_log,
            db_block_index,
            db_canonical,
            db_meta,
            db_evidence,
            db_checkpoints,
            db_checkpoint_meta,
            db_mempool,
            db_mempool_nonces,
        })
    }

    pub fn path(&self) -> &Path {
        &self.env_path
    }

    fn u64_key(v: u64) -> [u8; 8] {
        v.to_be_bytes()
    }

    fn decode_u64(raw: &[u8]) -> Result<u64, StorageError> {
        let arr: [u8; 8] = raw
            .try_into()
            .map_err(|_| StorageError::Corrupt(format!("expected 8-byte integer, got {} bytes", raw.len())))?;
        Ok(u64::from_be_bytes(arr))
    }

    fn read_counter<T: LmdbTxn>(&self, txn: &T, key: &[u8]) -> Result<u64, StorageError> {
        match txn.get(self.db_meta, &key) {
            Ok(v) => Self::decode_u64(v),
            Err(lmdb::Error::NotFound) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_counter(&self, txn: &mut RwTransaction<'_>, key: &[u8], value: u64) -> Result<(), StorageError> {
        txn.put(self.db_meta, &key, &Self::u64_key(value), WriteFlags::empty())?;
        Ok(())
    }

    fn del_ignore_missing(txn: &mut RwTransaction<'_>, db: Database, key: &[u8]) -> Result<(), StorageError> {
        match txn.del(db, &key, None) {
            Ok(()) | Err(lmdb::Error::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite one canonical slot without touching anything else.
    /// Only meant for corruption drills.
    #[doc(hidden)]
    pub fn overwrite_canonical_slot(&self, height: u64, hash: &Hash) -> Result<(), StorageError> {
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(self.db_canonical, &Self::u64_key(height), hash.as_bytes(), WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// BLOCKS
// ════════════════════════════════════════════════════════════════════════════

impl BlockStorage for ChainDb {
    fn append_block(&self, block: &Block, canonical: bool) -> Result<IndexEntry, StorageError> {
        let blob = bincode::serialize(block)?;
        let mut wtxn = self.env.begin_rw_txn()?;

        let position = self.read_counter(&wtxn, KEY_LOG_LEN)?;
        let entry = IndexEntry {
            hash: block.hash,
            height: block.header.height,
            parent: block.header.previous_hash,
            position,
        };
        wtxn.put(self.db_block_log, &Self::u64_key(position), &blob, WriteFlags::empty())?;
        wtxn.put(self.db_block_index, block.hash.as_bytes(), &bincode::serialize(&entry)?, WriteFlags::empty())?;
        self.write_counter(&mut wtxn, KEY_LOG_LEN, position + 1)?;

        if canonical {
            let tip_len = self.read_counter(&wtxn, KEY_CANONICAL_LEN)?;
            if tip_len != block.header.height {
                // dropping the txn aborts it
                return Err(StorageError::Corrupt(format!(
                    "canonical append at height {} but tip is {}",
                    block.header.height, tip_len
                )));
            }
            wtxn.put(
                self.db_canonical,
                &Self::u64_key(block.header.height),
                block.hash.as_bytes(),
                WriteFlags::empty(),
            )?;
            self.write_counter(&mut wtxn, KEY_CANONICAL_LEN, tip_len + 1)?;
        }
        wtxn.commit()?;
        debug!(height = entry.height, position, canonical, "block appended to log");
        Ok(entry)
    }

    fn read_block(&self, position: u64) -> Result<Option<Block>, StorageError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_block_log, &Self::u64_key(position)) {
            Ok(v) => Ok(Some(bincode::deserialize(v)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn log_len(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.begin_ro_txn()?;
        self.read_counter(&rtxn, KEY_LOG_LEN)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.env.sync(true)?;
        Ok(())
    }

    fn load_index(&self) -> Result<StoredIndex, StorageError> {
        let rtxn = self.env.begin_ro_txn()?;

        let mut entries = Vec::new();
        {
            let mut cursor = rtxn.open_ro_cursor(self.db_block_index)?;
            for (_key, val) in cursor.iter() {
                let entry: IndexEntry = bincode::deserialize(val)?;
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.position);

        let canonical_len = self.read_counter(&rtxn, KEY_CANONICAL_LEN)?;
        let mut canonical = Vec::with_capacity(canonical_len as usize);
        for height in 0..canonical_len {
            match rtxn.get(self.db_canonical, &Self::u64_key(height)) {
                Ok(raw) => {
                    let hash = Hash::from_slice(raw)
                        .ok_or_else(|| StorageError::Corrupt(format!("bad canonical hash at {}", height)))?;
                    canonical.push(hash);
                }
                Err(lmdb::Error::NotFound) => {
                    return Err(StorageError::Corrupt(format!("canonical slot {} missing", height)));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(StoredIndex { entries, canonical })
    }

    fn write_canonical(&self, from_height: u64, hashes: &[Hash]) -> Result<(), StorageError> {
        let mut wtxn = self.env.begin_rw_txn()?;
        let tip_len = self.read_counter(&wtxn, KEY_CANONICAL_LEN)?;
        if from_height > tip_len {
            return Err(StorageError::Corrupt(format!(
                "canonical rewrite from {} past tip {}",
                from_height, tip_len
            )));
        }
        for height in from_height..tip_len {
            Self::del_ignore_missing(&mut wtxn, self.db_canonical, &Self::u64_key(height))?;
        }
        for (i, hash) in hashes.iter().enumerate() {
            let height = from_height + i as u64;
            wtxn.put(self.db_canonical, &Self::u64_key(height), hash.as_bytes(), WriteFlags::empty())?;
        }
        self.write_counter(&mut wtxn, KEY_CANONICAL_LEN, from_height + hashes.len() as u64)?;
        wtxn.commit()?;
        Ok(())
    }

    fn replace_index(&self, index: &StoredIndex) -> Result<(), StorageError> {
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.clear_db(self.db_block_index)?;
        wtxn.clear_db(self.db_canonical)?;
        for entry in &index.entries {
            wtxn.put(self.db_block_index, entry.hash.as_bytes(), &bincode::serialize(entry)?, WriteFlags::empty())?;
        }
        for (height, hash) in index.canonical.iter().enumerate() {
            wtxn.put(self.db_canonical, &Self::u64_key(height as u64), hash.as_bytes(), WriteFlags::empty())?;
        }
        self.write_counter(&mut wtxn, KEY_CANONICAL_LEN, index.canonical.len() as u64)?;
        wtxn.commit()?;
        info!(entries = index.entries.len(), canonical = index.canonical.len(), "block index replaced");
        Ok(())
    }

    fn put_evidence(&self, record: &EvidenceRecord) -> Result<(), StorageError> {
        let blob = bincode::serialize(record)?;
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(self.db_evidence, record.id.as_bytes(), &blob, WriteFlags::empty())?;
        wtxn.commit()?;
        debug!(id = %record.id.short(), height = record.height, "evidence stored");
        Ok(())
    }

    fn load_evidence(&self) -> Result<Vec<EvidenceRecord>, StorageError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_evidence)?;
        let mut out: Vec<EvidenceRecord> = Vec::new();
        for (_key, val) in cursor.iter() {
            out.push(bincode::deserialize(val)?);
        }
        out.sort_by_key(|r| r.seq);
        Ok(out)
    }

    fn reset(&self) -> Result<(), StorageError> {
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.clear_db(self.db_block_log)?;
        wtxn.clear_db(self.db_block_index)?;
        wtxn.clear_db(self.db_canonical)?;
        wtxn.clear_db(self.db_evidence)?;
        Self::del_ignore_missing(&mut wtxn, self.db_meta, KEY_LOG_LEN)?;
        Self::del_ignore_missing(&mut wtxn, self.db_meta, KEY_CANONICAL_LEN)?;
        wtxn.commit()?;
        info!("block log and index reset");
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CHECKPOINTS
// ════════════════════════════════════════════════════════════════════════════

impl CheckpointStorage for ChainDb {
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let key = Self::u64_key(checkpoint.id);
        let blob = bincode::serialize(checkpoint)?;
        let meta = bincode::serialize(&checkpoint.meta())?;
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(self.db_checkpoints, &key, &blob, WriteFlags::empty())?;
        wtxn.put(self.db_checkpoint_meta, &key, &meta, WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(())
    }

    fn load_checkpoint(&self, id: u64) -> Result<Option<Checkpoint>, StorageError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_checkpoints, &Self::u64_key(id)) {
            Ok(v) => Ok(Some(bincode::deserialize(v)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>, StorageError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_checkpoint_meta)?;
        let mut out = Vec::new();
        for (_key, val) in cursor.iter() {
            out.push(bincode::deserialize(val)?);
        }
        Ok(out)
    }

    fn delete_checkpoint(&self, id: u64) -> Result<(), StorageError> {
        let key = Self::u64_key(id);
        let mut wtxn = self.env.begin_rw_txn()?;
        Self::del_ignore_missing(&mut wtxn, self.db_checkpoints, &key)?;
        Self::del_ignore_missing(&mut wtxn, self.db_checkpoint_meta, &key)?;
        wtxn.commit()?;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MEMPOOL
// ════════════════════════════════════════════════════════════════════════════

impl MempoolStorage for ChainDb {
    fn put_pool_tx(&self, entry: &PersistedTx) -> Result<(), StorageError> {
        let blob = bincode::serialize(entry)?;
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(self.db_mempool, entry.tx.hash.as_bytes(), &blob, WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(())
    }

    fn delete_pool_tx(&self, hash: &Hash) -> Result<(), StorageError> {
        let mut wtxn = self.env.begin_rw_txn()?;
        Self::del_ignore_missing(&mut wtxn, self.db_mempool, hash.as_bytes())?;
        wtxn.commit()?;
        Ok(())
    }

    fn put_nonce_watermark(&self, address: &Address, nonce: u64) -> Result<(), StorageError> {
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(self.db_mempool_nonces, address.as_bytes(), &Self::u64_key(nonce), WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(())
    }

    fn load_pool(&self) -> Result<PoolSnapshot, StorageError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut snapshot = PoolSnapshot::default();
        {
            let mut cursor = rtxn.open_ro_cursor(self.db_mempool)?;
            for (_key, val) in cursor.iter() {
                match bincode::deserialize::<PersistedTx>(val) {
                    Ok(entry) => snapshot.txs.push(entry),
                    // unreadable entries are dropped like invalid ones
                    Err(e) => debug!(error = %e, "skipping undecodable pooled transaction"),
                }
            }
        }
        let mut cursor = rtxn.open_ro_cursor(self.db_mempool_nonces)?;
        for (key, val) in cursor.iter() {
            let raw: [u8; 20] = match key.try_into() {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            snapshot.watermarks.push((Address::from_bytes(raw), Self::decode_u64(val)?));
        }
        Ok(snapshot)
    }
}
