//! Fee-prioritized transaction pool.
//!
//! Ranking is fee-per-byte, compared by cross multiplication; ties go to
//! the older transaction. A transaction selected for a proposal is marked
//! `Proposed(id)` and is not handed out again until the proposal is released
//! or its block is applied.
//!
//! Replay protection: a sender's nonce must exceed both the ledger nonce and
//! the highest nonce the pool has accepted from that sender (the watermark).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MempoolConfig;
use crate::crypto::SignatureVerifier;
use crate::error::{ChainResult, StateError, ValidationError};
use crate::storage::MempoolStorage;
use crate::tx::{cmp_fee_rate, Transaction};
use crate::types::{Address, Amount, Hash};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolTxStatus {
    Pending,
    /// Handed to proposal `id`.
    Proposed(u64),
}

#[derive(Debug, Clone)]
pub struct PooledTx {
    pub tx: Transaction,
    pub size: usize,
    /// Unix ms.
    pub added_at: u64,
    pub status: PoolTxStatus,
    seq: u64,
}

impl PooledTx {
    fn key(&self) -> FeeKey {
        FeeKey { fee: self.tx.fee, size: self.size, seq: self.seq, hash: self.tx.hash }
    }
}

/// What survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTx {
    pub tx: Transaction,
    pub added_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    Included,
    Evicted,
    Expired,
    /// Nonce already used on chain.
    Stale,
    /// Failed ledger checks while building a block.
    Invalid,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RemovalReason::Included => "included",
            RemovalReason::Evicted => "evicted",
            RemovalReason::Expired => "expired",
            RemovalReason::Stale => "stale",
            RemovalReason::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub hash: Hash,
    pub broadcast: bool,
    pub evicted: Vec<Hash>,
}

#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: u64,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MempoolStats {
    pub count: usize,
    pub bytes: usize,
    pub pending: usize,
    pub proposed: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub expired: u64,
}

/// Ascending = worst first: lower fee rate, then newer, then hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FeeKey {
    fee: Amount,
    size: usize,
    seq: u64,
    hash: Hash,
}

impl Ord for FeeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_fee_rate(self.fee, self.size, other.fee, other.size)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for FeeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    txs: HashMap<Hash, PooledTx>,
    by_fee: BTreeSet<FeeKey>,
    by_sender: HashMap<Address, BTreeMap<u64, Hash>>,
    watermarks: HashMap<Address, u64>,
    total_bytes: usize,
    next_seq: u64,
    next_proposal: u64,
    stats: MempoolStats,
}

impl PoolInner {
    fn insert(&mut self, tx: Transaction, added_at: u64) {
        let size = tx.size_bytes();
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = PooledTx { tx, size, added_at, status: PoolTxStatus::Pending, seq };
        self.by_fee.insert(entry.key());
        self.by_sender.entry(entry.tx.sender).or_default().insert(entry.tx.nonce, entry.tx.hash);
        self.total_bytes += size;
        let wm = self.watermarks.entry(entry.tx.sender).or_insert(0);
        *wm = (*wm).max(entry.tx.nonce);
        self.txs.insert(entry.tx.hash, entry);
    }

    fn remove(&mut self, hash: &Hash) -> Option<PooledTx> {
        let entry = self.txs.remove(hash)?;
        self.by_fee.remove(&entry.key());
        if let Some(nonces) = self.by_sender.get_mut(&entry.tx.sender) {
            nonces.remove(&entry.tx.nonce);
            if nonces.is_empty() {
                self.by_sender.remove(&entry.tx.sender);
            }
        }
        self.total_bytes -= entry.size;
        Some(entry)
    }

    /// After dropping a transaction that never made it on chain, lower the
    /// watermark to what is still pooled so the nonce can be reused.
    fn relax_watermark(&mut self, sender: &Address) -> u64 {
        let highest = self
            .by_sender
            .get(sender)
            .and_then(|n| n.keys().next_back().copied())
            .unwrap_or(0);
        self.watermarks.insert(*sender, highest);
        highest
    }

    fn known_nonce(&self, sender: &Address, ledger_nonce: u64) -> u64 {
        ledger_nonce.max(self.watermarks.get(sender).copied().unwrap_or(0))
    }

    /// Pick the cheapest pending transactions with a strictly lower fee rate
    /// than `new_tx` that free enough room. Nothing is removed here.
    fn eviction_plan(&self, cfg: &MempoolConfig, new_tx: &Transaction, required_bytes: usize) -> Result<Vec<Hash>, StateError> {
        if required_bytes > cfg.max_bytes {
            return Err(StateError::PoolFull);
        }
        let need_count = (self.txs.len() + 1).saturating_sub(cfg.max_transactions);
        let need_bytes = (self.total_bytes + required_bytes).saturating_sub(cfg.max_bytes);
        if need_count == 0 && need_bytes == 0 {
            return Ok(Vec::new());
        }
        if let Some(min) = self.by_fee.iter().next() {
            if cmp_fee_rate(new_tx.fee, required_bytes, min.fee, min.size) != Ordering::Greater {
                return Err(StateError::PoolFull);
            }
        }

        let mut plan = Vec::new();
        let (mut freed_count, mut freed_bytes) = (0usize, 0usize);
        for key in &self.by_fee {
            if freed_count >= need_count && freed_bytes >= need_bytes {
                break;
            }
            if cmp_fee_rate(key.fee, key.size, new_tx.fee, required_bytes) != Ordering::Less {
                break;
            }
            let pending = self.txs.get(&key.hash).map(|e| e.status == PoolTxStatus::Pending).unwrap_or(false);
            if !pending {
                continue;
            }
            plan.push(key.hash);
            freed_count += 1;
            freed_bytes += key.size;
        }
        if freed_count >= need_count && freed_bytes >= need_bytes {
            Ok(plan)
        } else {
            Err(StateError::PoolFull)
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MEMPOOL
// ════════════════════════════════════════════════════════════════════════════

pub struct Mempool {
    config: MempoolConfig,
    verifier: Arc<dyn SignatureVerifier>,
    storage: Option<Arc<dyn MempoolStorage>>,
    inner: RwLock<PoolInner>,
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool").field("config", &self.config).field("stats", &self.stats()).finish()
    }
}

impl Mempool {
    /// `storage` is only written when `config.persist` is set.
    pub fn new(
        config: MempoolConfig,
        verifier: Arc<dyn SignatureVerifier>,
        storage: Option<Arc<dyn MempoolStorage>>,
    ) -> Self {
        let storage = if config.persist { storage } else { None };
        Self { config, verifier, storage, inner: RwLock::new(PoolInner::default()) }
    }

    pub fn len(&self) -> usize {
        self.inner.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.read().txs.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<PooledTx> {
        self.inner.read().txs.get(hash).cloned()
    }

    pub fn watermark(&self, sender: &Address) -> u64 {
        self.inner.read().watermarks.get(sender).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> MempoolStats {
        let inner = self.inner.read();
        let proposed = inner.txs.values().filter(|e| e.status != PoolTxStatus::Pending).count();
        MempoolStats {
            count: inner.txs.len(),
            bytes: inner.total_bytes,
            pending: inner.txs.len() - proposed,
            proposed,
            ..inner.stats.clone()
        }
    }

    /// Admit `tx`.
    ///
    /// ## Arguments
    /// * `broadcast` - echoed in the outcome for the transport layer
    /// * `ledger_nonce` - sender's current on-chain nonce
    /// * `now_ms` - insertion time
    ///
    /// ## Returns
    /// The hash plus any transactions evicted to make room.
    pub fn add_transaction(
        &self,
        tx: Transaction,
        broadcast: bool,
        ledger_nonce: u64,
        now_ms: u64,
    ) -> ChainResult<AddOutcome> {
        let mut inner = self.inner.write();
        match self.admit(&mut inner, tx, broadcast, ledger_nonce, now_ms) {
            Ok(outcome) => {
                inner.stats.accepted += 1;
                Ok(outcome)
            }
            Err(e) => {
                inner.stats.rejected += 1;
                debug!(error = %e, "transaction rejected by mempool");
                Err(e)
            }
        }
    }

    fn admit(
        &self,
        inner: &mut PoolInner,
        tx: Transaction,
        broadcast: bool,
        ledger_nonce: u64,
        now_ms: u64,
    ) -> ChainResult<AddOutcome> {
        // ─── 1. duplicate
        if inner.txs.contains_key(&tx.hash) {
            return Err(ValidationError::DuplicateTransaction(tx.hash.short()).into());
        }
        // ─── 2. structure + signature
        tx.validate(self.verifier.as_ref())?;
        // ─── 3. fee floor
        if tx.fee < self.config.min_fee {
            return Err(ValidationError::FeeTooLow { fee: tx.fee, min: self.config.min_fee }.into());
        }
        // ─── 4. replay
        let known = inner.known_nonce(&tx.sender, ledger_nonce);
        if tx.nonce <= known {
            return Err(StateError::StaleNonce { address: tx.sender, nonce: tx.nonce, current: known }.into());
        }
        // ─── 5. capacity
        let size = tx.size_bytes();
        let plan = inner.eviction_plan(&self.config, &tx, size)?;

        let hash = tx.hash;
        if let Some(storage) = &self.storage {
            storage.put_pool_tx(&PersistedTx { tx: tx.clone(), added_at: now_ms })?;
            storage.put_nonce_watermark(&tx.sender, inner.known_nonce(&tx.sender, 0).max(tx.nonce))?;
        }
        let evicted = self.drop_many(inner, &plan, RemovalReason::Evicted);
        inner.insert(tx, now_ms);
        if !evicted.is_empty() {
            info!(tx = %hash.short(), evicted = evicted.len(), "evicted lower-fee transactions");
        }
        Ok(AddOutcome { hash, broadcast, evicted })
    }

    /// Make room for `new_tx` by evicting strictly lower fee-rate pending
    /// transactions, the fewest needed. Evicts nothing on failure.
    pub fn evict_lower_fee_transactions(&self, new_tx: &Transaction, required_bytes: usize) -> Result<Vec<Hash>, StateError> {
        let mut inner = self.inner.write();
        let plan = inner.eviction_plan(&self.config, new_tx, required_bytes)?;
        Ok(self.drop_many(&mut inner, &plan, RemovalReason::Evicted))
    }

    /// Best fee-rate first, nonce-consistent per sender, within the limits.
    /// Selected transactions become `Proposed(id)`.
    pub fn select_transactions_for_block(
        &self,
        max_bytes: usize,
        max_count: usize,
        nonce_of: impl Fn(&Address) -> u64,
    ) -> Proposal {
        let mut inner = self.inner.write();
        let id = inner.next_proposal;
        inner.next_proposal += 1;

        let ranked: Vec<Hash> = inner
            .by_fee
            .iter()
            .rev()
            .filter(|k| inner.txs.get(&k.hash).map(|e| e.status == PoolTxStatus::Pending).unwrap_or(false))
            .map(|k| k.hash)
            .collect();

        let mut next_nonce: HashMap<Address, u64> = HashMap::new();
        let mut chosen: Vec<Hash> = Vec::new();
        let mut taken: std::collections::HashSet<Hash> = std::collections::HashSet::new();
        let mut bytes = 0usize;

        // a later nonce may outrank an earlier one; repeat until nothing fits
        loop {
            let mut progressed = false;
            for hash in &ranked {
                if chosen.len() >= max_count {
                    break;
                }
                if taken.contains(hash) {
                    continue;
                }
                let entry = match inner.txs.get(hash) {
                    Some(e) => e,
                    None => continue,
                };
                let expected = *next_nonce
                    .entry(entry.tx.sender)
                    .or_insert_with(|| nonce_of(&entry.tx.sender).saturating_add(1));
                if entry.tx.nonce != expected || bytes + entry.size > max_bytes {
                    continue;
                }
                bytes += entry.size;
                next_nonce.insert(entry.tx.sender, expected + 1);
                taken.insert(*hash);
                chosen.push(*hash);
                progressed = true;
            }
            if !progressed || chosen.len() >= max_count {
                break;
            }
        }

        let mut transactions = Vec::with_capacity(chosen.len());
        for hash in &chosen {
            if let Some(e) = inner.txs.get_mut(hash) {
                e.status = PoolTxStatus::Proposed(id);
                transactions.push(e.tx.clone());
            }
        }
        debug!(proposal = id, count = transactions.len(), bytes, "transactions selected for block");
        Proposal { id, transactions }
    }

    /// Return a cancelled proposal's transactions to `Pending`.
    pub fn release_proposal(&self, id: u64) -> usize {
        let mut inner = self.inner.write();
        let mut released = 0;
        for e in inner.txs.values_mut() {
            if e.status == PoolTxStatus::Proposed(id) {
                e.status = PoolTxStatus::Pending;
                released += 1;
            }
        }
        released
    }

    /// Drop transactions that made it into a block.
    pub fn remove_included(&self, hashes: &[Hash]) -> Vec<Hash> {
        let mut inner = self.inner.write();
        self.drop_many(&mut inner, hashes, RemovalReason::Included)
    }

    /// Drop specific transactions (e.g. failed ledger checks) and free their nonces.
    pub fn remove_invalid(&self, hashes: &[Hash]) -> Vec<Hash> {
        let mut inner = self.inner.write();
        self.drop_many(&mut inner, hashes, RemovalReason::Invalid)
    }

    /// Drop transactions whose nonce the ledger has already consumed.
    pub fn prune_stale(&self, nonce_of: impl Fn(&Address) -> u64) -> Vec<Hash> {
        let mut inner = self.inner.write();
        let stale: Vec<Hash> = inner
            .txs
            .values()
            .filter(|e| e.tx.nonce <= nonce_of(&e.tx.sender))
            .map(|e| e.tx.hash)
            .collect();
        self.drop_many(&mut inner, &stale, RemovalReason::Stale)
    }

    /// Drop pending transactions older than `expiration_ms`.
    pub fn expire(&self, now_ms: u64) -> Vec<Hash> {
        let mut inner = self.inner.write();
        let ttl = self.config.expiration_ms;
        let old: Vec<Hash> = inner
            .txs
            .values()
            .filter(|e| e.status == PoolTxStatus::Pending && now_ms.saturating_sub(e.added_at) >= ttl)
            .map(|e| e.tx.hash)
            .collect();
        let removed = self.drop_many(&mut inner, &old, RemovalReason::Expired);
        inner.stats.expired += removed.len() as u64;
        if !removed.is_empty() {
            info!(count = removed.len(), "expired transactions swept");
        }
        removed
    }

    /// Put back transactions from blocks a reorg removed. The watermark is
    /// not consulted since those nonces were consumed by the abandoned
    /// branch only; the ledger nonce still is.
    pub fn readmit(&self, txs: Vec<Transaction>, nonce_of: impl Fn(&Address) -> u64, now_ms: u64) -> Vec<Hash> {
        let mut inner = self.inner.write();
        let mut readmitted = Vec::new();
        for tx in txs {
            let sender = tx.sender;
            let ok = !inner.txs.contains_key(&tx.hash)
                && tx.validate(self.verifier.as_ref()).is_ok()
                && tx.nonce > nonce_of(&sender)
                && inner.eviction_plan(&self.config, &tx, tx.size_bytes()).map(|p| p.is_empty()).unwrap_or(false);
            if !ok {
                debug!(tx = %tx.hash.short(), sender = %sender, "transaction not readmitted");
                continue;
            }
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.put_pool_tx(&PersistedTx { tx: tx.clone(), added_at: now_ms }) {
                    warn!(tx = %tx.hash.short(), error = %e, "failed to persist readmitted transaction");
                }
            }
            readmitted.push(tx.hash);
            inner.insert(tx, now_ms);
        }
        if !readmitted.is_empty() {
            info!(count = readmitted.len(), "transactions readmitted after reorg");
        }
        readmitted
    }

    fn drop_many(&self, inner: &mut PoolInner, hashes: &[Hash], reason: RemovalReason) -> Vec<Hash> {
        let mut removed = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let entry = match inner.remove(hash) {
                Some(e) => e,
                None => continue,
            };
            if reason != RemovalReason::Included {
                let wm = inner.relax_watermark(&entry.tx.sender);
                if let Some(storage) = &self.storage {
                    if let Err(e) = storage.put_nonce_watermark(&entry.tx.sender, wm) {
                        warn!(error = %e, "failed to persist nonce watermark");
                    }
                }
            }
            if let Some(storage) = &self.storage {
                // a leftover record fails re-validation on reload
                if let Err(e) = storage.delete_pool_tx(hash) {
                    warn!(tx = %hash.short(), error = %e, "failed to delete pooled transaction");
                }
            }
            if reason == RemovalReason::Evicted {
                inner.stats.evicted += 1;
            }
            removed.push(*hash);
        }
        removed
    }

    // ────────────────────────────────────────────────────────────────────────
    // persistence
    // ────────────────────────────────────────────────────────────────────────

    /// Reload persisted contents. Watermarks come back verbatim; every
    /// transaction is re-validated and invalid ones are dropped silently.
    /// Returns the number of transactions restored.
    pub fn load_persisted(&self, nonce_of: impl Fn(&Address) -> u64) -> ChainResult<usize> {
        let storage = match &self.storage {
            Some(s) => s.clone(),
            None => return Ok(0),
        };
        let snapshot = storage.load_pool()?;
        let mut entries = snapshot.txs;
        entries.sort_by_key(|e| (e.added_at, e.tx.nonce));

        let mut inner = self.inner.write();
        for (address, nonce) in snapshot.watermarks {
            inner.watermarks.insert(address, nonce);
        }

        let mut restored = 0;
        for entry in entries {
            let hash = entry.tx.hash;
            let ok = !inner.txs.contains_key(&hash)
                && entry.tx.validate(self.verifier.as_ref()).is_ok()
                && entry.tx.fee >= self.config.min_fee
                && entry.tx.nonce > nonce_of(&entry.tx.sender)
                && inner.eviction_plan(&self.config, &entry.tx, entry.tx.size_bytes()).map(|p| p.is_empty()).unwrap_or(false);
            if ok {
                inner.insert(entry.tx, entry.added_at);
                restored += 1;
            } else if let Err(e) = storage.delete_pool_tx(&hash) {
                warn!(tx = %hash.short(), error = %e, "failed to delete invalid pooled transaction");
            }
        }
        info!(restored, "mempool reloaded from storage");
        Ok(restored)
    }

    /// Pending and proposed transactions, best fee-rate first.
    pub fn snapshot(&self) -> Vec<PooledTx> {
        let inner = self.inner.read();
        inner.by_fee.iter().rev().filter_map(|k| inner.txs.get(&k.hash).cloned()).collect()
    }
}
