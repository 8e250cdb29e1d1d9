//! UTXO audit index.
//!
//! Derived from ledger effects: every credit creates an output, every debit
//! spends the owner's outputs (oldest outpoint first) and returns change. The
//! account ledger stays authoritative; when this index cannot cover a debit
//! it is reconciled toward the ledger balances.
//!
//! Spending moves an entry into the spent index instead of deleting it, so
//! undoing a block restores exactly what it consumed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::crypto::sha3_512_concat;
use crate::types::{Address, Amount, Hash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub owner: Address,
    pub amount: Amount,
    pub height: u64,
    pub block_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentEntry {
    pub entry: UtxoEntry,
    pub spent_by: Hash,
    pub spent_height: u64,
    pub spent_block: Hash,
}

/// Ledger effect as seen by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtxoOp {
    Spend { txid: Hash, owner: Address, amount: Amount },
    Create { txid: Hash, owner: Address, amount: Amount },
}

/// Outputs created and consumed by one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUtxoDelta {
    pub height: u64,
    pub created: Vec<OutPoint>,
    pub spent: Vec<OutPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoSnapshot {
    pub unspent: BTreeMap<OutPoint, UtxoEntry>,
    pub spent: BTreeMap<OutPoint, SpentEntry>,
    pub deltas: BTreeMap<Hash, BlockUtxoDelta>,
}

/// Debits the index could not cover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub shortfalls: Vec<(Address, Amount)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.shortfalls.is_empty()
    }
}

/// Per-address disagreement between ledger and index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoMismatch {
    pub address: Address,
    pub ledger: Amount,
    pub utxo: Amount,
}

/// Pseudo transaction id carrying a block's reward, fees and bonuses.
pub fn coinbase_id(block_hash: &Hash) -> Hash {
    sha3_512_concat(&[b"coinbase", block_hash.as_bytes()])
}

fn reconcile_id(block_hash: &Hash) -> Hash {
    sha3_512_concat(&[b"reconcile", block_hash.as_bytes()])
}

#[derive(Debug, Clone, Default)]
pub struct UtxoIndex {
    unspent: BTreeMap<OutPoint, UtxoEntry>,
    spent: BTreeMap<OutPoint, SpentEntry>,
    deltas: BTreeMap<Hash, BlockUtxoDelta>,
    by_owner: HashMap<Address, BTreeSet<OutPoint>>,
}

impl PartialEq for UtxoIndex {
    fn eq(&self, other: &Self) -> bool {
        self.unspent == other.unspent && self.spent == other.spent
    }
}

impl UtxoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unspent(&self) -> &BTreeMap<OutPoint, UtxoEntry> {
        &self.unspent
    }

    pub fn spent(&self) -> &BTreeMap<OutPoint, SpentEntry> {
        &self.spent
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.unspent.get(outpoint)
    }

    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.unspent.contains_key(outpoint)
    }

    pub fn balance_of(&self, owner: &Address) -> Amount {
        self.by_owner
            .get(owner)
            .map(|set| {
                set.iter()
                    .filter_map(|op| self.unspent.get(op))
                    .fold(0u128, |acc, e| acc.saturating_add(e.amount))
            })
            .unwrap_or(0)
    }

    pub fn total_unspent(&self) -> Amount {
        self.unspent.values().fold(0u128, |acc, e| acc.saturating_add(e.amount))
    }

    pub fn has_delta(&self, block_hash: &Hash) -> bool {
        self.deltas.contains_key(block_hash)
    }

    // ────────────────────────────────────────────────────────────────────────
    // apply / undo
    // ────────────────────────────────────────────────────────────────────────

    /// Apply one block's ops in order. Never fails; uncovered debits are
    /// reported so the caller can reconcile.
    pub fn apply_block(&mut self, height: u64, block_hash: Hash, ops: &[UtxoOp]) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut next_index: HashMap<Hash, u32> = HashMap::new();
        let mut delta = self.deltas.remove(&block_hash).unwrap_or_default();
        delta.height = height;

        for op in ops {
            match op {
                UtxoOp::Create { txid, owner, amount } => {
                    if *amount == 0 {
                        continue;
                    }
                    let idx = next_index.entry(*txid).or_insert(0);
                    let outpoint = OutPoint { txid: *txid, index: *idx };
                    *idx += 1;
                    self.insert_unspent(outpoint, UtxoEntry { owner: *owner, amount: *amount, height, block_hash });
                    delta.created.push(outpoint);
                }
                UtxoOp::Spend { txid, owner, amount } => {
                    if *amount == 0 {
                        continue;
                    }
                    let candidates: Vec<OutPoint> = self
                        .by_owner
                        .get(owner)
                        .map(|s| s.iter().copied().collect())
                        .unwrap_or_default();
                    let mut gathered: Amount = 0;
                    for outpoint in candidates {
                        if gathered >= *amount {
                            break;
                        }
                        if let Some(entry) = self.remove_unspent(&outpoint) {
                            gathered = gathered.saturating_add(entry.amount);
                            self.spent.insert(
                                outpoint,
                                SpentEntry { entry, spent_by: *txid, spent_height: height, spent_block: block_hash },
                            );
                            delta.spent.push(outpoint);
                        }
                    }
                    if gathered > *amount {
                        let idx = next_index.entry(*txid).or_insert(0);
                        let change = OutPoint { txid: *txid, index: *idx };
                        *idx += 1;
                        self.insert_unspent(
                            change,
                            UtxoEntry { owner: *owner, amount: gathered - *amount, height, block_hash },
                        );
                        delta.created.push(change);
                    } else if gathered < *amount {
                        report.shortfalls.push((*owner, *amount - gathered));
                    }
                }
            }
        }
        self.deltas.insert(block_hash, delta);
        report
    }

    /// Reverse a block: restore what it spent, drop what it created.
    /// Returns false when no delta is recorded for the block.
    pub fn undo_block(&mut self, block_hash: &Hash) -> bool {
        let delta = match self.deltas.remove(block_hash) {
            Some(d) => d,
            None => return false,
        };
        for outpoint in delta.spent.iter().rev() {
            if let Some(spent) = self.spent.remove(outpoint) {
                self.insert_unspent(*outpoint, spent.entry);
            }
        }
        for outpoint in delta.created.iter().rev() {
            if self.remove_unspent(outpoint).is_none() && self.spent.remove(outpoint).is_some() {
                error!(block = %block_hash.short(), "undo removed an output still spent by a later block");
            }
        }
        true
    }

    /// Credit outside any block (penalty payouts). The output sits at
    /// `(txid, 0)`, has no block delta and survives block undo.
    pub fn credit_external(&mut self, txid: Hash, owner: Address, amount: Amount, height: u64) {
        if amount == 0 {
            return;
        }
        let outpoint = OutPoint { txid, index: 0 };
        self.insert_unspent(outpoint, UtxoEntry { owner, amount, height, block_hash: txid });
    }

    /// Drop an output made by [`Self::credit_external`].
    pub fn retract_external(&mut self, txid: &Hash) -> Option<UtxoEntry> {
        let outpoint = OutPoint { txid: *txid, index: 0 };
        let entry = self.remove_unspent(&outpoint);
        if entry.is_none() && self.spent.remove(&outpoint).is_some() {
            error!(txid = %txid.short(), "retracted an external output already spent");
        }
        entry
    }

    /// Make per-owner totals equal the ledger balances. Corrections are
    /// recorded under `block_hash` so undoing that block reverses them.
    pub fn reconcile(
        &mut self,
        balances: &BTreeMap<Address, Amount>,
        height: u64,
        block_hash: Hash,
    ) -> Vec<UtxoMismatch> {
        let mismatches = self.audit(balances);
        if mismatches.is_empty() {
            return mismatches;
        }
        let rid = reconcile_id(&block_hash);
        let mut ops = Vec::with_capacity(mismatches.len());
        for m in &mismatches {
            if m.ledger > m.utxo {
                ops.push(UtxoOp::Create { txid: rid, owner: m.address, amount: m.ledger - m.utxo });
            } else {
                ops.push(UtxoOp::Spend { txid: rid, owner: m.address, amount: m.utxo - m.ledger });
            }
        }
        // reconcile ops get their own index space under `rid`, appended to the block delta
        let report = self.apply_block(height, block_hash, &ops);
        if !report.is_clean() {
            error!(?report, "utxo reconciliation left shortfalls");
        }
        debug!(count = mismatches.len(), height, "utxo index reconciled toward ledger");
        mismatches
    }

    /// Addresses whose unspent total differs from the ledger balance.
    pub fn audit(&self, balances: &BTreeMap<Address, Amount>) -> Vec<UtxoMismatch> {
        let mut owners: BTreeSet<Address> = balances.keys().copied().collect();
        owners.extend(self.by_owner.iter().filter(|(_, s)| !s.is_empty()).map(|(a, _)| *a));
        owners
            .into_iter()
            .filter_map(|address| {
                let ledger = balances.get(&address).copied().unwrap_or(0);
                let utxo = self.balance_of(&address);
                (ledger != utxo).then_some(UtxoMismatch { address, ledger, utxo })
            })
            .collect()
    }

    /// Forget deltas and spent entries of blocks below `height`.
    pub fn prune_below(&mut self, height: u64) {
        let old: Vec<Hash> = self
            .deltas
            .iter()
            .filter(|(_, d)| d.height < height)
            .map(|(h, _)| *h)
            .collect();
        for h in old {
            self.deltas.remove(&h);
        }
        self.spent.retain(|_, s| s.spent_height >= height);
    }

    // ────────────────────────────────────────────────────────────────────────
    // snapshot
    // ────────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> UtxoSnapshot {
        UtxoSnapshot {
            unspent: self.unspent.clone(),
            spent: self.spent.clone(),
            deltas: self.deltas.clone(),
        }
    }

    pub fn from_snapshot(snapshot: UtxoSnapshot) -> Self {
        let mut by_owner: HashMap<Address, BTreeSet<OutPoint>> = HashMap::new();
        for (op, e) in &snapshot.unspent {
            by_owner.entry(e.owner).or_default().insert(*op);
        }
        Self {
            unspent: snapshot.unspent,
            spent: snapshot.spent,
            deltas: snapshot.deltas,
            by_owner,
        }
    }

    fn insert_unspent(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.by_owner.entry(entry.owner).or_default().insert(outpoint);
        self.unspent.insert(outpoint, entry);
    }

    fn remove_unspent(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        let entry = self.unspent.remove(outpoint)?;
        if let Some(set) = self.by_owner.get_mut(&entry.owner) {
            set.remove(outpoint);
            if set.is_empty() {
                self.by_owner.remove(&entry.owner);
            }
        }
        Some(entry)
    }
}
