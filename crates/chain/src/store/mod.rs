//! Block store.
//!
//! Owns the canonical chain and everything derived from it: the ledger,
//! the UTXO index, the per-block undo journals and the orphan pool. Blocks
//! arrive through [`BlockStore::add_block`] and end up in one of five places:
//!
//! ```text
//! parent == tip                 -> applied, becomes the new tip
//! parent known, fork longer     -> reorganization onto the fork
//! parent known, fork not longer -> stored as side chain
//! parent unknown                -> orphan pool, retried when the parent lands
//! already canonical / orphaned  -> ignored
//! ```
//!
//! A reorganization works on clones of ledger and UTXO index and only swaps
//! them in after the new branch applied cleanly and the canonical list was
//! persisted. Within `max_reorg_depth` blocks the undo journals rewind the
//! clones; deeper forks rewind through the nearest canonical checkpoint at or
//! below the fork point (or genesis) and replay.
//!
//! Accepted double-sign evidence is kept next to the block log. Each record
//! carries the ledger height its penalty was enforced at:
//!
//! ```text
//! replay past that height  -> penalty enforced again after that block
//! rewind below that height -> penalty lifted first, enforced again on the new tip
//! ```

pub mod index;
pub mod orphan;

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::block::Block;
use crate::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::config::ChainConfig;
use crate::consensus::{DoubleSignEvidence, EvidenceRecord};
use crate::crypto::SignatureVerifier;
use crate::error::{ChainResult, ConsistencyError, ValidationError};
use crate::events::ChainEvent;
use crate::state::{AppliedBlock, BlockUndo, ChainState, SlashReport};
use crate::storage::BlockStorage;
use crate::types::{Address, Hash, TREASURY_ADDRESS};
use crate::utxo::{UtxoIndex, UtxoMismatch, UtxoOp};

pub use index::ChainIndex;
pub use orphan::OrphanPool;

/// How a reorganization got back to the fork point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindPath {
    Journal,
    Checkpoint(u64),
    Genesis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgSummary {
    pub depth: u64,
    pub common_ancestor: u64,
    /// Previously canonical blocks, lowest first.
    pub removed: Vec<Hash>,
    /// Newly canonical blocks, lowest first.
    pub added: Vec<Hash>,
    pub rewound: RewindPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Applied { height: u64, hash: Hash },
    Reorganized(ReorgSummary),
    SideChain { height: u64, hash: Hash },
    Orphaned { height: u64, hash: Hash },
    AlreadyKnown { hash: Hash },
}

impl BlockOutcome {
    /// Whether the block is now part of the canonical chain.
    pub fn is_canonical(&self) -> bool {
        matches!(self, BlockOutcome::Applied { .. } | BlockOutcome::Reorganized(_))
    }
}

/// Everything `add_block` changed, including orphans it adopted.
#[derive(Debug, Clone)]
pub struct AddBlockReport {
    pub outcome: BlockOutcome,
    /// Blocks that became canonical, in application order.
    pub connected: Vec<Block>,
    /// Blocks that left the canonical chain.
    pub disconnected: Vec<Block>,
    pub events: Vec<ChainEvent>,
}

#[derive(Debug, Default)]
struct Changes {
    connected: Vec<Block>,
    disconnected: Vec<Block>,
    events: Vec<ChainEvent>,
}

impl Changes {
    fn record_connected(&mut self, block: &Block, applied: &AppliedBlock, mismatches: usize) {
        self.events.push(ChainEvent::BlockApplied {
            height: block.height(),
            hash: block.hash,
            proposer: block.header.proposer,
            tx_count: block.transactions.len(),
            reward: applied.reward,
            fees: applied.fees,
        });
        for (address, kind, amount) in &applied.bonuses {
            self.events.push(ChainEvent::BonusAwarded { address: *address, kind: *kind, amount: *amount });
        }
        for (address, from, to) in applied.status_changes() {
            self.events.push(ChainEvent::ValidatorStateChanged { address, from, to });
        }
        if mismatches > 0 {
            self.events.push(ChainEvent::UtxoReconciled { height: block.height(), mismatches });
        }
        self.connected.push(block.clone());
    }
}

/// Ledger, UTXO index and journals moved together.
struct Working {
    ledger: ChainState,
    utxo: UtxoIndex,
    undo: VecDeque<BlockUndo>,
}

// ════════════════════════════════════════════════════════════════════════════
// BLOCK STORE
// ════════════════════════════════════════════════════════════════════════════

pub struct BlockStore {
    config: Arc<ChainConfig>,
    verifier: Arc<dyn SignatureVerifier>,
    storage: Arc<dyn BlockStorage>,
    checkpoints: CheckpointManager,
    index: ChainIndex,
    ledger: ChainState,
    utxo: UtxoIndex,
    undo: VecDeque<BlockUndo>,
    /// Accepted evidence, in acceptance order.
    evidence: Vec<EvidenceRecord>,
    orphans: OrphanPool,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("tip", &self.index.tip())
            .field("journal_depth", &self.undo.len())
            .field("evidence", &self.evidence.len())
            .field("orphans", &self.orphans.len())
            .finish()
    }
}

impl BlockStore {
    /// Open on top of `storage` and bring the ledger to the stored tip.
    ///
    /// ## Steps
    /// 1. load the index; if it fails verification rebuild it from the log,
    ///    and if the log itself is unusable reset the store
    /// 2. restore the nearest verified checkpoint on the canonical chain
    /// 3. replay canonical blocks above it, enforcing stored penalties at
    ///    their heights
    ///
    /// ## Returns
    /// The store and the recovery events (rebuild, reset, checkpoint restore).
    pub fn open(
        config: Arc<ChainConfig>,
        verifier: Arc<dyn SignatureVerifier>,
        storage: Arc<dyn BlockStorage>,
        checkpoints: CheckpointManager,
    ) -> ChainResult<(Self, Vec<ChainEvent>)> {
        let mut events = Vec::new();
        let index = Self::load_or_rebuild_index(storage.as_ref(), &mut events)?;
        let evidence = storage.load_evidence()?;
        let orphans = OrphanPool::new(config.checkpoint.max_orphans);
        let mut store = Self {
            config,
            verifier,
            storage,
            checkpoints,
            index,
            ledger: ChainState::new(),
            utxo: UtxoIndex::new(),
            undo: VecDeque::new(),
            evidence,
            orphans,
        };
        store.recover(&mut events)?;
        Ok((store, events))
    }

    fn load_or_rebuild_index(storage: &dyn BlockStorage, events: &mut Vec<ChainEvent>) -> ChainResult<ChainIndex> {
        let loaded = storage
            .load_index()
            .map_err(|e| ConsistencyError::IndexCorrupted(e.to_string()))
            .and_then(ChainIndex::from_stored)
            .and_then(|index| Self::spot_check_tip(storage, &index).map(|_| index));
        let reason = match loaded {
            Ok(index) => return Ok(index),
            Err(e) => e,
        };

        error!(error = %reason, "block index not trusted, rebuilding from log");
        match ChainIndex::rebuild(storage) {
            Ok(stored) => {
                storage.replace_index(&stored)?;
                let blocks = stored.entries.len() as u64;
                let index = ChainIndex::from_stored(stored)?;
                events.push(ChainEvent::IndexRebuilt { blocks });
                Ok(index)
            }
            Err(e) => {
                error!(error = %e, "block log unusable, resetting store");
                storage.reset()?;
                events.push(ChainEvent::StoreReset { reason: e.to_string() });
                Ok(ChainIndex::new())
            }
        }
    }

    /// The tip entry must point at a log record carrying that hash.
    fn spot_check_tip(storage: &dyn BlockStorage, index: &ChainIndex) -> Result<(), ConsistencyError> {
        let (height, hash) = match index.tip() {
            Some(t) => t,
            None => return Ok(()),
        };
        let entry = index
            .get(&hash)
            .ok_or_else(|| ConsistencyError::IndexCorrupted(format!("tip at {} not indexed", height)))?;
        match storage.read_block(entry.position) {
            Ok(Some(block)) if block.hash == hash => Ok(()),
            Ok(_) => Err(ConsistencyError::IndexCorrupted(format!("tip at {} points at the wrong record", height))),
            Err(e) => Err(ConsistencyError::IndexCorrupted(e.to_string())),
        }
    }

    fn recover(&mut self, events: &mut Vec<ChainEvent>) -> ChainResult<()> {
        let tip = match self.index.tip_height() {
            Some(t) => t,
            None => return Ok(()),
        };
        let index = &self.index;
        let checkpoint = self.checkpoints.nearest_matching(tip, |m| index.is_canonical(m.height, &m.tip_hash))?;
        if let Some(cp) = checkpoint {
            self.ledger.restore_state_snapshot(&cp.ledger)?;
            self.utxo = UtxoIndex::from_snapshot(cp.utxo);
            events.push(ChainEvent::CheckpointRestored { id: cp.id, height: cp.height });
        }
        let from = self.next_height();
        let replayed = self.replay_blocks_from(from)?;
        info!(tip = self.ledger.height, replayed, "block store recovered");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // queries
    // ────────────────────────────────────────────────────────────────────────

    pub fn ledger(&self) -> &ChainState {
        &self.ledger
    }

    /// For missed-slot penalties, which no block records.
    pub(crate) fn ledger_mut(&mut self) -> &mut ChainState {
        &mut self.ledger
    }

    pub fn utxo(&self) -> &UtxoIndex {
        &self.utxo
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn tip(&self) -> Option<(u64, Hash)> {
        self.index.tip()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Undo journals currently held.
    pub fn journal_depth(&self) -> usize {
        self.undo.len()
    }

    fn next_height(&self) -> u64 {
        if self.ledger.has_genesis() {
            self.ledger.height + 1
        } else {
            0
        }
    }

    fn load_block(&self, hash: &Hash) -> ChainResult<Block> {
        let entry = self.index.get(hash).ok_or_else(|| ConsistencyError::MissingBlock(hash.short()))?;
        match self.storage.read_block(entry.position)? {
            Some(block) if block.hash == *hash => Ok(block),
            _ => Err(ConsistencyError::MissingBlock(hash.short()).into()),
        }
    }

    pub fn get_block(&self, hash: &Hash) -> ChainResult<Option<Block>> {
        if !self.index.contains(hash) {
            return Ok(None);
        }
        self.load_block(hash).map(Some)
    }

    pub fn get_block_by_height(&self, height: u64) -> ChainResult<Option<Block>> {
        match self.index.canonical_hash(height) {
            Some(hash) => self.load_block(&hash).map(Some),
            None => Ok(None),
        }
    }

    /// Canonical blocks in `from..=to`, clipped to the tip.
    pub fn get_blocks_range(&self, from: u64, to: u64) -> ChainResult<Vec<Block>> {
        self.index.canonical_range(from, to).iter().map(|h| self.load_block(h)).collect()
    }

    pub fn audit_utxo(&self) -> Vec<UtxoMismatch> {
        self.utxo.audit(&self.ledger.balances)
    }

    pub fn flush(&self) -> ChainResult<()> {
        Ok(self.storage.flush()?)
    }

    // ────────────────────────────────────────────────────────────────────────
    // add_block
    // ────────────────────────────────────────────────────────────────────────

    /// Route `block` (see module docs), then adopt any orphans it unlocks.
    ///
    /// An `Err` means the submitted block was rejected; nothing changed.
    pub fn add_block(&mut self, block: Block, now_ms: u64) -> ChainResult<AddBlockReport> {
        let mut changes = Changes::default();
        let outcome = self.route(block, now_ms, &mut changes)?;

        let mut queue: VecDeque<Hash> = VecDeque::new();
        match &outcome {
            BlockOutcome::Applied { hash, .. } | BlockOutcome::SideChain { hash, .. } => queue.push_back(*hash),
            BlockOutcome::Reorganized(summary) => queue.extend(summary.added.last().copied()),
            BlockOutcome::Orphaned { .. } | BlockOutcome::AlreadyKnown { .. } => {}
        }
        while let Some(parent) = queue.pop_front() {
            for child in self.orphans.take_children(&parent) {
                let (height, hash) = (child.height(), child.hash);
                match self.route(child, now_ms, &mut changes) {
                    Ok(BlockOutcome::Orphaned { .. }) | Ok(BlockOutcome::AlreadyKnown { .. }) => {}
                    Ok(_) => {
                        debug!(height, hash = %hash.short(), "orphan adopted");
                        queue.push_back(hash);
                    }
                    Err(e) => {
                        warn!(height, hash = %hash.short(), error = %e, "orphan rejected");
                        changes.events.push(ChainEvent::BlockRejected { height, hash, reason: e.to_string() });
                    }
                }
            }
        }

        Ok(AddBlockReport {
            outcome,
            connected: changes.connected,
            disconnected: changes.disconnected,
            events: changes.events,
        })
    }

    fn route(&mut self, block: Block, now_ms: u64, changes: &mut Changes) -> ChainResult<BlockOutcome> {
        let (height, hash) = (block.height(), block.hash);
        if self.index.is_canonical(height, &hash) || self.orphans.contains(&hash) {
            return Ok(BlockOutcome::AlreadyKnown { hash });
        }

        let c = &self.config.consensus;
        block.validate_structure(self.verifier.as_ref(), c.max_block_transactions, c.max_block_bytes)?;
        if block.header.timestamp > now_ms.saturating_add(c.max_future_drift_ms) {
            return Err(ValidationError::TimestampOutOfRange(height).into());
        }

        let tip = self.index.tip();
        let parent = match block.parent() {
            None => {
                if tip.is_some() {
                    return Err(ValidationError::MalformedBlock {
                        height,
                        reason: "chain already has a genesis block".to_string(),
                    }
                    .into());
                }
                self.connect_tip(block, now_ms, changes)?;
                return Ok(BlockOutcome::Applied { height, hash });
            }
            Some(p) => p,
        };

        if tip.map(|(_, h)| h) == Some(parent) {
            self.connect_tip(block, now_ms, changes)?;
            return Ok(BlockOutcome::Applied { height, hash });
        }

        let parent_height = match self.index.get(&parent) {
            Some(entry) => entry.height,
            None => {
                let dropped = self.orphans.insert(block);
                debug!(height, hash = %hash.short(), dropped = dropped.len(), "block orphaned");
                changes.events.push(ChainEvent::BlockOrphaned { height, hash });
                return Ok(BlockOutcome::Orphaned { height, hash });
            }
        };
        if parent_height + 1 != height {
            return Err(ValidationError::MalformedBlock {
                height,
                reason: format!("parent is at height {}", parent_height),
            }
            .into());
        }

        let tip_height = tip.map(|(h, _)| h).unwrap_or(0);
        if height > tip_height {
            let summary = self.reorganize(block, now_ms, changes)?;
            return Ok(BlockOutcome::Reorganized(summary));
        }

        if !self.index.contains(&hash) {
            let entry = self.storage.append_block(&block, false)?;
            self.index.insert(entry);
        }
        debug!(height, hash = %hash.short(), tip_height, "side chain block stored");
        changes.events.push(ChainEvent::SideChainStored { height, hash });
        Ok(BlockOutcome::SideChain { height, hash })
    }

    /// Apply on top of the tip, then persist. A persistence failure rolls
    /// the in-memory effects back.
    fn connect_tip(&mut self, block: Block, now_ms: u64, changes: &mut Changes) -> ChainResult<()> {
        let applied = self.ledger.apply_block(&self.config, &block)?;
        let mismatches = apply_utxo(&mut self.utxo, &self.ledger, &block, &applied.utxo_ops);

        let persisted = match self.index.get(&block.hash).cloned() {
            // stored earlier as side chain (or above a restored checkpoint)
            Some(entry) => self.storage.write_canonical(block.height(), &[block.hash]).map(|_| entry),
            None => self.storage.append_block(&block, true),
        };
        let entry = match persisted {
            Ok(entry) => entry,
            Err(e) => {
                if let Err(undo_err) = self.ledger.undo_block(&applied.undo) {
                    error!(error = %undo_err, "ledger rollback after failed write");
                }
                self.utxo.undo_block(&block.hash);
                return Err(e.into());
            }
        };
        self.index.insert(entry);
        self.index.set_canonical_from(block.height(), &[block.hash]);
        push_undo(&mut self.undo, &mut self.utxo, applied.undo.clone(), self.config.checkpoint.max_reorg_depth);

        changes.record_connected(&block, &applied, mismatches);
        self.maybe_checkpoint(now_ms, changes);
        Ok(())
    }

    fn maybe_checkpoint(&self, now_ms: u64, changes: &mut Changes) {
        if !self.checkpoints.is_due(self.ledger.height) {
            return;
        }
        match self.checkpoints.create_checkpoint(&self.ledger, &self.utxo, now_ms) {
            Ok(meta) => changes.events.push(ChainEvent::CheckpointCreated { id: meta.id, height: meta.height }),
            Err(e) => error!(height = self.ledger.height, error = %e, "automatic checkpoint failed"),
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // reorganization
    // ────────────────────────────────────────────────────────────────────────

    fn reorganize(&mut self, block: Block, now_ms: u64, changes: &mut Changes) -> ChainResult<ReorgSummary> {
        let parent = block.parent().ok_or_else(|| ValidationError::MalformedBlock {
            height: block.height(),
            reason: "fork block without parent".to_string(),
        })?;
        let (ancestor, branch) = self
            .index
            .fork_point(&parent)
            .ok_or_else(|| ConsistencyError::IndexCorrupted("fork does not reach the canonical chain".to_string()))?;
        let tip_height = self.index.tip_height().unwrap_or(0);
        let depth = tip_height - ancestor;

        // ─── 1. gather both sides before touching anything
        let removed: Vec<Hash> = self.index.canonical_range(ancestor + 1, tip_height).to_vec();
        let removed_blocks = removed.iter().map(|h| self.load_block(h)).collect::<ChainResult<Vec<_>>>()?;
        let mut new_blocks = branch.iter().map(|h| self.load_block(h)).collect::<ChainResult<Vec<_>>>()?;
        new_blocks.push(block);

        // ─── 2. rewind copies to the fork point
        let mut work = Working { ledger: self.ledger.clone(), utxo: self.utxo.clone(), undo: self.undo.clone() };
        let rewound = if depth as usize <= work.undo.len() {
            for _ in 0..depth {
                let undo = work.undo.pop_back().ok_or(ConsistencyError::UndoUnavailable(work.ledger.height))?;
                let height = work.ledger.height;
                lift_penalties(&mut work.ledger, &mut work.utxo, height);
                work.ledger.undo_block(&undo)?;
                work.utxo.undo_block(&undo.hash);
            }
            RewindPath::Journal
        } else {
            self.rebuild_to(&mut work, ancestor)?
        };

        // ─── 3. apply the branch
        let mut connected = Vec::with_capacity(new_blocks.len());
        for b in &new_blocks {
            let applied = work.ledger.apply_block(&self.config, b).map_err(|e| {
                warn!(height = b.height(), hash = %b.hash.short(), error = %e, "fork block rejected, reorg abandoned");
                e
            })?;
            let mismatches = apply_utxo(&mut work.utxo, &work.ledger, b, &applied.utxo_ops);
            push_undo(&mut work.undo, &mut work.utxo, applied.undo.clone(), self.config.checkpoint.max_reorg_depth);
            connected.push((applied, mismatches));
        }

        // ─── 4. penalties lifted by the rewind land on the new tip
        let mut evidence = self.evidence.clone();
        let moved = settle_penalties(&self.config, &mut evidence, &mut work.ledger, &mut work.utxo);

        // ─── 5. persist, then swap in
        let added: Vec<Hash> = new_blocks.iter().map(|b| b.hash).collect();
        if let Some(tip_block) = new_blocks.last() {
            if !self.index.contains(&tip_block.hash) {
                let entry = self.storage.append_block(tip_block, false)?;
                self.index.insert(entry);
            }
        }
        for record in &moved {
            self.storage.put_evidence(record)?;
        }
        self.storage.write_canonical(ancestor + 1, &added)?;
        self.index.set_canonical_from(ancestor + 1, &added);
        self.ledger = work.ledger;
        self.utxo = work.utxo;
        self.undo = work.undo;
        self.evidence = evidence;

        warn!(
            depth,
            ancestor,
            removed = removed.len(),
            added = added.len(),
            penalties_moved = moved.len(),
            ?rewound,
            "chain reorganized"
        );
        for (b, (applied, mismatches)) in new_blocks.iter().zip(connected.iter()) {
            changes.record_connected(b, applied, *mismatches);
        }
        changes.disconnected.extend(removed_blocks);
        changes.events.push(ChainEvent::ChainReorganized {
            depth,
            common_ancestor: ancestor,
            removed: removed.clone(),
            added: added.clone(),
        });

        let index = &self.index;
        if let Err(e) = self.checkpoints.prune_stale(|h, hash| index.is_canonical(h, hash)) {
            error!(error = %e, "stale checkpoint pruning failed");
        }
        self.maybe_checkpoint(now_ms, changes);

        Ok(ReorgSummary { depth, common_ancestor: ancestor, removed, added, rewound })
    }

    /// Rebuild `work` at `ancestor` from the nearest canonical checkpoint,
    /// or from an empty ledger, by replaying canonical blocks.
    fn rebuild_to(&self, work: &mut Working, ancestor: u64) -> ChainResult<RewindPath> {
        let index = &self.index;
        let checkpoint = self.checkpoints.nearest_matching(ancestor, |m| index.is_canonical(m.height, &m.tip_hash))?;
        let (start, path) = match checkpoint {
            Some(cp) => {
                work.ledger = ChainState::new();
                work.ledger.restore_state_snapshot(&cp.ledger)?;
                work.utxo = UtxoIndex::from_snapshot(cp.utxo);
                (cp.height + 1, RewindPath::Checkpoint(cp.id))
            }
            None => {
                work.ledger = ChainState::new();
                work.utxo = UtxoIndex::new();
                (0, RewindPath::Genesis)
            }
        };
        work.undo.clear();
        info!(from = start, to = ancestor, ?path, "deep fork, replaying to common ancestor");

        if work.ledger.has_genesis() {
            enforce_due_penalties(&self.config, &self.evidence, &mut work.ledger, &mut work.utxo);
        }
        for height in start..=ancestor {
            let hash = self.index.canonical_hash(height).ok_or(ConsistencyError::MissingBlock(format!("height {}", height)))?;
            let block = self.load_block(&hash)?;
            let applied = work.ledger.replay_block(&self.config, &block)?;
            apply_utxo(&mut work.utxo, &work.ledger, &block, &applied.utxo_ops);
            push_undo(&mut work.undo, &mut work.utxo, applied.undo, self.config.checkpoint.max_reorg_depth);
            enforce_due_penalties(&self.config, &self.evidence, &mut work.ledger, &mut work.utxo);
        }
        Ok(path)
    }

    // ────────────────────────────────────────────────────────────────────────
    // replay / checkpoints
    // ────────────────────────────────────────────────────────────────────────

    /// Replay canonical blocks from `from_height` up to the index tip.
    ///
    /// `from_height` must be the height the ledger expects next. A block
    /// that no longer applies truncates the canonical chain at its height.
    /// Stored penalties are enforced after the block at their height; any
    /// left above the final tip are enforced there and moved to it.
    ///
    /// ## Returns
    /// Number of blocks replayed.
    pub fn replay_blocks_from(&mut self, from_height: u64) -> ChainResult<u64> {
        let expected = self.next_height();
        if from_height != expected {
            return Err(ConsistencyError::LedgerMismatch(format!(
                "ledger expects height {}, replay asked from {}",
                expected, from_height
            ))
            .into());
        }
        let tip = match self.index.tip_height() {
            Some(t) => t,
            None => return Ok(0),
        };
        if self.ledger.has_genesis() {
            enforce_due_penalties(&self.config, &self.evidence, &mut self.ledger, &mut self.utxo);
        }

        let mut replayed = 0;
        for height in from_height..=tip {
            let hash = match self.index.canonical_hash(height) {
                Some(h) => h,
                None => break,
            };
            let block = self.load_block(&hash)?;
            match self.ledger.replay_block(&self.config, &block) {
                Ok(applied) => {
                    apply_utxo(&mut self.utxo, &self.ledger, &block, &applied.utxo_ops);
                    push_undo(&mut self.undo, &mut self.utxo, applied.undo, self.config.checkpoint.max_reorg_depth);
                    enforce_due_penalties(&self.config, &self.evidence, &mut self.ledger, &mut self.utxo);
                    replayed += 1;
                }
                Err(e) => {
                    error!(height, hash = %hash.short(), error = %e, "canonical block failed replay, truncating chain");
                    self.storage.write_canonical(height, &[])?;
                    self.index.set_canonical_from(height, &[]);
                    break;
                }
            }
        }
        self.settle_and_persist()?;
        Ok(replayed)
    }

    /// Enforce penalties still missing from the ledger on the current tip
    /// and store their new heights.
    fn settle_and_persist(&mut self) -> ChainResult<()> {
        if !self.ledger.has_genesis() {
            return Ok(());
        }
        let moved = settle_penalties(&self.config, &mut self.evidence, &mut self.ledger, &mut self.utxo);
        for record in &moved {
            self.storage.put_evidence(record)?;
        }
        Ok(())
    }

    pub fn create_checkpoint(&self, now_ms: u64) -> ChainResult<CheckpointMeta> {
        self.checkpoints.create_checkpoint(&self.ledger, &self.utxo, now_ms)
    }

    /// Rewind block store, ledger and UTXO index to checkpoint `id`.
    ///
    /// Everything is verified before anything moves. Blocks above the
    /// checkpoint stay in the log as side chain. Penalties accepted after
    /// the checkpoint stay in force.
    ///
    /// ## Returns
    /// The checkpoint and the blocks that left the canonical chain.
    pub fn restore_from_checkpoint(&mut self, id: u64) -> ChainResult<(CheckpointMeta, Vec<Block>)> {
        let cp = self
            .checkpoints
            .load(id)?
            .ok_or_else(|| ConsistencyError::NoRecoveryPoint(format!("checkpoint {} not found", id)))?;
        cp.verify()?;
        if !self.index.is_canonical(cp.height, &cp.tip_hash) {
            return Err(ConsistencyError::CheckpointIntegrity {
                id,
                reason: format!("tip {} is not canonical at height {}", cp.tip_hash.short(), cp.height),
            }
            .into());
        }
        let mut ledger = ChainState::new();
        ledger.restore_state_snapshot(&cp.ledger)?;
        let utxo = UtxoIndex::from_snapshot(cp.utxo.clone());

        let tip_height = self.index.tip_height().unwrap_or(cp.height);
        let removed = self.get_blocks_range(cp.height + 1, tip_height)?;

        self.storage.write_canonical(cp.height + 1, &[])?;
        self.index.set_canonical_from(cp.height + 1, &[]);
        self.ledger = ledger;
        self.utxo = utxo;
        self.undo.clear();
        self.settle_and_persist()?;

        info!(id, height = cp.height, dropped = removed.len(), "checkpoint restored");
        Ok((cp.meta(), removed))
    }

    // ────────────────────────────────────────────────────────────────────────
    // evidence
    // ────────────────────────────────────────────────────────────────────────

    /// Verify double-sign evidence, punish the offender and store the
    /// evidence so the penalty outlives restarts and reorganizations.
    pub fn apply_double_sign(&mut self, evidence: &DoubleSignEvidence) -> ChainResult<(Address, SlashReport)> {
        let offender = evidence.verify(self.verifier.as_ref())?;
        let id = evidence.id();
        let seq = self.evidence.last().map(|r| r.seq + 1).unwrap_or(0);
        let report = self.ledger.slash_double_sign(&self.config, id, seq, &offender)?;
        let record = EvidenceRecord { id, seq, offender, height: self.ledger.height, evidence: evidence.clone() };
        if let Err(e) = self.storage.put_evidence(&record) {
            self.ledger.lift_slash(&id);
            return Err(e.into());
        }
        // the treasury output hangs off the evidence id, not a block
        self.utxo.credit_external(id, TREASURY_ADDRESS, report.slashed, self.ledger.height);
        self.evidence.push(record);
        Ok((offender, report))
    }

    pub fn evidence(&self) -> &[EvidenceRecord] {
        &self.evidence
    }
}

/// Enforce stored penalties due at or below the ledger height.
fn enforce_due_penalties(cfg: &ChainConfig, records: &[EvidenceRecord], ledger: &mut ChainState, utxo: &mut UtxoIndex) {
    for r in records {
        if r.height <= ledger.height && !ledger.slashes.contains_key(&r.id) {
            let report = ledger.enforce_slash(cfg, r.id, r.seq, &r.offender);
            utxo.credit_external(r.id, TREASURY_ADDRESS, report.slashed, ledger.height);
        }
    }
}

/// Enforce every stored penalty missing from the ledger at its current
/// height. Returns the records that moved.
fn settle_penalties(
    cfg: &ChainConfig,
    records: &mut [EvidenceRecord],
    ledger: &mut ChainState,
    utxo: &mut UtxoIndex,
) -> Vec<EvidenceRecord> {
    let mut moved = Vec::new();
    for r in records.iter_mut() {
        if ledger.slashes.contains_key(&r.id) {
            continue;
        }
        let report = ledger.enforce_slash(cfg, r.id, r.seq, &r.offender);
        utxo.credit_external(r.id, TREASURY_ADDRESS, report.slashed, ledger.height);
        if r.height != ledger.height {
            debug!(evidence = %r.id.short(), from = r.height, to = ledger.height, "penalty moved to new tip");
            r.height = ledger.height;
            moved.push(r.clone());
        }
    }
    moved
}

/// Lift penalties enforced at or above `height` along with their treasury outputs.
fn lift_penalties(ledger: &mut ChainState, utxo: &mut UtxoIndex, height: u64) {
    for id in ledger.lift_slashes_from(height) {
        utxo.retract_external(&id);
    }
}

/// Feed ledger effects to the index; reconcile toward the ledger on shortfall.
fn apply_utxo(utxo: &mut UtxoIndex, ledger: &ChainState, block: &Block, ops: &[UtxoOp]) -> usize {
    let report = utxo.apply_block(block.height(), block.hash, ops);
    if report.is_clean() {
        return 0;
    }
    warn!(height = block.height(), shortfalls = report.shortfalls.len(), "utxo index could not cover ledger debits");
    utxo.reconcile(&ledger.balances, block.height(), block.hash).len()
}

fn push_undo(undo: &mut VecDeque<BlockUndo>, utxo: &mut UtxoIndex, entry: BlockUndo, max_depth: u64) {
    let height = entry.height;
    undo.push_back(entry);
    while undo.len() as u64 > max_depth {
        undo.pop_front();
    }
    if height > max_depth {
        utxo.prune_below(height - max_depth);
    }
}
