//! # rPoS Chain Core
//!
//! Single-node core of a reputation-weighted proof-of-stake chain: block
//! store with fork handling, account ledger, derived UTXO index,
//! checkpoints, slot-based consensus and a fee-ranked transaction pool.
//!
//! ## Module Overview
//!
//! | Module       | Concern                                                   |
//! |--------------|-----------------------------------------------------------|
//! | `types`      | `Hash` (SHA3-512), `Address`, `Amount`, `SCALE`            |
//! | `crypto`     | hashing, `SignatureVerifier`, `KeySigner`, Ed25519         |
//! | `config`     | immutable `ChainConfig`, JSON loading, range checks        |
//! | `error`      | `ChainError` taxonomy                                      |
//! | `validator`  | validator record and status transition table              |
//! | `tx`         | signed transactions (transfer, stake, unstake, unjail)    |
//! | `block`      | header, body, signing, structural checks                  |
//! | `tokenomics` | halving schedule and supply cap                           |
//! | `state`      | account ledger, undo journal, snapshots                   |
//! | `utxo`       | UTXO index with spent index                               |
//! | `checkpoint` | verified ledger + UTXO snapshots                          |
//! | `store`      | block store: index, orphans, reorg, recovery              |
//! | `consensus`  | proposer selection, slots, double-sign evidence           |
//! | `mempool`    | fee-per-byte pool with proposals and persistence          |
//! | `events`     | chain events and listeners                                |
//! | `storage`    | storage traits and in-memory fake                         |
//! | `db`         | LMDB backend                                              |
//!
//! ## Locking
//!
//! ```text
//! Chain
//!  ├── RwLock<Core { BlockStore, ConsensusEngine }>   block apply, reorg, restore
//!  ├── Mempool (own lock)                             queried concurrently
//!  └── EventEmitter                                   called after the core lock is released
//! ```

pub mod block;
pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod mempool;
pub mod state;
pub mod storage;
pub mod store;
pub mod tokenomics;
pub mod tx;
pub mod types;
pub mod utxo;
pub mod validator;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

pub use block::{Block, BlockHeader};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMeta};
pub use config::{ChainConfig, ConfigError};
pub use consensus::{ConsensusEngine, DoubleSignEvidence, Slot, SlotStatus};
pub use crypto::{Ed25519Signer, Ed25519Verifier, KeySigner, SignatureVerifier};
pub use db::ChainDb;
pub use error::{ChainError, ChainResult, ConsensusError, ConsistencyError, StateError, ValidationError};
pub use events::{ChainEvent, ChainEventListener, ChannelListener, CompositeListener, EventEmitter, LoggingListener};
pub use mempool::{AddOutcome, Mempool, MempoolStats, RemovalReason};
pub use state::{ChainState, SlashReport};
pub use storage::{BlockStorage, CheckpointStorage, MemoryStorage, MempoolStorage, StorageError};
pub use store::{BlockOutcome, BlockStore, ReorgSummary};
pub use tx::{Transaction, TxKind};
pub use types::{Address, Amount, Hash, SCALE, TREASURY_ADDRESS};
pub use utxo::UtxoMismatch;
pub use validator::{Validator, ValidatorStatus};

/// Room left for the header when filling a block from the pool.
const HEADER_RESERVE_BYTES: usize = 1024;

/// Wall clock in unix ms.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

struct Core {
    store: BlockStore,
    consensus: ConsensusEngine,
}

// ════════════════════════════════════════════════════════════════════════════
// CHAIN
// ════════════════════════════════════════════════════════════════════════════

/// Entry point for the transport layer and the node loop.
///
/// Every mutation of block store, ledger and UTXO index goes through the
/// core write lock, so readers never see a half-applied block. Events are
/// emitted after the lock is released.
pub struct Chain {
    config: Arc<ChainConfig>,
    core: RwLock<Core>,
    mempool: Mempool,
    events: EventEmitter,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").field("tip", &self.tip()).field("mempool", &self.mempool).finish()
    }
}

impl Chain {
    /// Open the chain on explicit storage backends.
    ///
    /// ## Steps
    /// 1. validate `config`
    /// 2. open the block store (index check, checkpoint restore, replay)
    /// 3. reload the persisted pool, re-validating every transaction
    ///
    /// ## Errors
    /// `Config` for out-of-range settings, `Persistence` when storage cannot
    /// be read, `Consistency` when no recovery path is left.
    pub fn open(
        config: ChainConfig,
        verifier: Arc<dyn SignatureVerifier>,
        blocks: Arc<dyn BlockStorage>,
        checkpoints: Arc<dyn CheckpointStorage>,
        pool: Option<Arc<dyn MempoolStorage>>,
        listener: Arc<dyn ChainEventListener>,
    ) -> ChainResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let events = EventEmitter::new(listener);

        let manager = CheckpointManager::new(checkpoints, config.checkpoint.clone())?;
        let (store, recovery) = BlockStore::open(config.clone(), verifier.clone(), blocks, manager)?;
        for event in recovery {
            events.emit(event);
        }

        let mempool = Mempool::new(config.mempool.clone(), verifier, pool);
        let ledger = store.ledger();
        let restored = mempool.load_persisted(|a| ledger.nonce_of(a))?;
        info!(height = ledger.height, tip = ?ledger.tip_hash.map(|h| h.short()), pooled = restored, "chain opened");

        let consensus = ConsensusEngine::new(config.clone());
        Ok(Self { config, core: RwLock::new(Core { store, consensus }), mempool, events })
    }

    /// LMDB-backed chain at `path` with the Ed25519 verifier.
    pub fn open_lmdb(
        path: impl AsRef<Path>,
        config: ChainConfig,
        listener: Arc<dyn ChainEventListener>,
    ) -> ChainResult<Self> {
        let db = Arc::new(ChainDb::open(path)?);
        Self::open(config, Arc::new(Ed25519Verifier), db.clone(), db.clone(), Some(db), listener)
    }

    /// Volatile chain for tests and throwaway nodes.
    pub fn in_memory(config: ChainConfig, listener: Arc<dyn ChainEventListener>) -> ChainResult<Self> {
        let mem = Arc::new(MemoryStorage::new());
        Self::open(config, Arc::new(Ed25519Verifier), mem.clone(), mem.clone(), Some(mem), listener)
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    fn emit_all(&self, events: Vec<ChainEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // blocks
    // ────────────────────────────────────────────────────────────────────────

    /// Create and apply the genesis block, signed by the genesis operator.
    pub fn init_genesis(&self, signer: &dyn KeySigner, now_ms: u64) -> ChainResult<Block> {
        if let Some((height, _)) = self.tip() {
            return Err(StateError::HeightMismatch { expected: height + 1, got: 0 }.into());
        }
        let reward = tokenomics::block_reward(&self.config.reward, 0, 0);
        let genesis = Block::genesis(now_ms, reward, signer);
        self.add_block_at(genesis.clone(), now_ms)?;
        info!(hash = %genesis.hash.short(), proposer = %genesis.header.proposer, "genesis created");
        Ok(genesis)
    }

    /// Accept a block from the network (or from local production).
    ///
    /// ## Returns
    /// Where the block landed. Orphans and side-chain blocks are `Ok` but not
    /// canonical (see [`BlockOutcome::is_canonical`]).
    pub fn add_block(&self, block: Block) -> ChainResult<BlockOutcome> {
        self.add_block_at(block, now_ms())
    }

    /// [`Self::add_block`] with an explicit clock.
    pub fn add_block_at(&self, block: Block, now_ms: u64) -> ChainResult<BlockOutcome> {
        let (height, hash) = (block.height(), block.hash);
        let mut core = self.core.write();
        match core.store.add_block(block, now_ms) {
            Ok(report) => {
                let mut events = report.events;
                self.sync_mempool(core.store.ledger(), &report.connected, report.disconnected, now_ms, &mut events);
                drop(core);
                self.emit_all(events);
                Ok(report.outcome)
            }
            Err(e) => {
                drop(core);
                warn!(height, hash = %hash.short(), kind = e.kind(), error = %e, "block rejected");
                self.events.emit(ChainEvent::BlockRejected { height, hash, reason: e.to_string() });
                Err(e)
            }
        }
    }

    /// Pool housekeeping after the canonical chain moved.
    ///
    /// Included transactions leave the pool, transactions of disconnected
    /// blocks come back, and anything the new ledger made stale is dropped.
    fn sync_mempool(
        &self,
        ledger: &ChainState,
        connected: &[Block],
        disconnected: Vec<Block>,
        now_ms: u64,
        events: &mut Vec<ChainEvent>,
    ) {
        let included: Vec<Hash> = connected.iter().flat_map(|b| b.transactions.iter().map(|t| t.hash)).collect();
        let removed = self.mempool.remove_included(&included);
        push_removed(events, &removed, RemovalReason::Included);

        if !disconnected.is_empty() {
            let included: HashSet<Hash> = included.into_iter().collect();
            let orphaned: Vec<Transaction> = disconnected
                .into_iter()
                .flat_map(|b| b.transactions)
                .filter(|t| !included.contains(&t.hash))
                .collect();
            let back = self.mempool.readmit(orphaned, |a| ledger.nonce_of(a), now_ms);
            for hash in back {
                events.push(ChainEvent::TransactionAdded { hash, broadcast: false });
            }
        }

        let stale = self.mempool.prune_stale(|a| ledger.nonce_of(a));
        push_removed(events, &stale, RemovalReason::Stale);
    }

    /// Build, sign and apply the block for the current slot.
    ///
    /// ## Errors
    /// `Consensus(NotProposer)` when `signer` does not own the open slot,
    /// or the pause reason when no slot can open.
    pub fn produce_block(&self, signer: &dyn KeySigner, now_ms: u64) -> ChainResult<Block> {
        let me = signer.address();
        let mut core = self.core.write();
        let (status, mut events) = poll_locked(&mut core, now_ms);
        let slot = match status {
            SlotStatus::Ready(slot) if slot.proposer == me => slot,
            SlotStatus::Paused(e) => {
                drop(core);
                self.emit_all(events);
                return Err(e.into());
            }
            _ => {
                drop(core);
                self.emit_all(events);
                return Err(ConsensusError::NotProposer(me).into());
            }
        };

        let ledger = core.store.ledger();
        let c = &self.config.consensus;
        let proposal = self.mempool.select_transactions_for_block(
            c.max_block_bytes.saturating_sub(HEADER_RESERVE_BYTES),
            c.max_block_transactions,
            |a| ledger.nonce_of(a),
        );

        // trial run on a scratch ledger; drop what no longer applies
        let timestamp = now_ms.max(ledger.last_block_timestamp);
        let mut scratch = ledger.clone();
        let mut included = Vec::with_capacity(proposal.transactions.len());
        let mut invalid = Vec::new();
        for tx in proposal.transactions {
            match scratch.apply_for_proposal(&self.config, &tx, &me, timestamp) {
                Ok(()) => included.push(tx),
                Err(e) => {
                    debug!(tx = %tx.hash.short(), error = %e, "dropping transaction from proposal");
                    invalid.push(tx.hash);
                }
            }
        }
        let removed = self.mempool.remove_invalid(&invalid);
        push_removed(&mut events, &removed, RemovalReason::Invalid);

        let reward = tokenomics::block_reward(&self.config.reward, slot.height, ledger.total_minted);
        let block = Block::build(slot.height, Some(slot.parent_hash), timestamp, slot.round, reward, included, signer);

        match core.store.add_block(block.clone(), now_ms) {
            Ok(report) => {
                events.extend(report.events);
                self.sync_mempool(core.store.ledger(), &report.connected, report.disconnected, now_ms, &mut events);
                drop(core);
                info!(height = block.height(), hash = %block.hash.short(), txs = block.transactions.len(), "block produced");
                self.emit_all(events);
                Ok(block)
            }
            Err(e) => {
                drop(core);
                self.mempool.release_proposal(proposal.id);
                error!(height = block.height(), error = %e, "own block rejected");
                self.emit_all(events);
                Err(e)
            }
        }
    }

    /// Advance slot timing. Misses are charged here.
    pub fn poll_consensus(&self, now_ms: u64) -> SlotStatus {
        let mut core = self.core.write();
        let (status, events) = poll_locked(&mut core, now_ms);
        drop(core);
        self.emit_all(events);
        status
    }

    /// Verify double-sign evidence, slash and tombstone the offender.
    pub fn report_double_sign(&self, evidence: &DoubleSignEvidence) -> ChainResult<SlashReport> {
        let (offender, report) = self.core.write().store.apply_double_sign(evidence)?;
        self.events.emit(ChainEvent::ValidatorSlashed { address: offender, amount: report.slashed });
        self.events.emit(ChainEvent::ValidatorStateChanged {
            address: offender,
            from: report.previous_status,
            to: ValidatorStatus::Tombstoned,
        });
        Ok(report)
    }

    // ────────────────────────────────────────────────────────────────────────
    // transactions
    // ────────────────────────────────────────────────────────────────────────

    /// Admit a transaction to the pool.
    ///
    /// The sender must be able to cover amount plus fee at the current tip;
    /// nonce and fee rules are the pool's.
    pub fn submit_transaction(&self, tx: Transaction, broadcast: bool) -> ChainResult<AddOutcome> {
        let now = now_ms();
        let ledger_nonce = {
            let core = self.core.read();
            let ledger = core.store.ledger();
            let needed = tx.total_debit().ok_or(StateError::Overflow("amount + fee"))?;
            let available = ledger.balance_of(&tx.sender);
            if available < needed {
                return Err(StateError::InsufficientBalance { address: tx.sender, needed, available }.into());
            }
            ledger.nonce_of(&tx.sender)
        };
        let outcome = self.mempool.add_transaction(tx, broadcast, ledger_nonce, now)?;
        self.events.emit(ChainEvent::TransactionAdded { hash: outcome.hash, broadcast: outcome.broadcast });
        self.events.transaction_removed(&outcome.evicted, RemovalReason::Evicted);
        Ok(outcome)
    }

    /// Drop pool entries older than the configured expiration.
    pub fn expire_mempool(&self, now_ms: u64) -> Vec<Hash> {
        let expired = self.mempool.expire(now_ms);
        self.events.transaction_removed(&expired, RemovalReason::Expired);
        expired
    }

    pub fn mempool_stats(&self) -> MempoolStats {
        self.mempool.stats()
    }

    // ────────────────────────────────────────────────────────────────────────
    // checkpoints / recovery
    // ────────────────────────────────────────────────────────────────────────

    pub fn create_checkpoint(&self) -> ChainResult<CheckpointMeta> {
        let meta = self.core.read().store.create_checkpoint(now_ms())?;
        self.events.emit(ChainEvent::CheckpointCreated { id: meta.id, height: meta.height });
        Ok(meta)
    }

    pub fn checkpoints(&self) -> ChainResult<Vec<CheckpointMeta>> {
        self.core.read().store.checkpoints().list()
    }

    /// Highest verified checkpoint at or below `target_height`.
    pub fn get_nearest_checkpoint(&self, target_height: u64) -> ChainResult<Option<Checkpoint>> {
        self.core.read().store.checkpoints().get_nearest_checkpoint(target_height)
    }

    /// Rewind block store, ledger and UTXO index to checkpoint `id`.
    /// Transactions of the dropped blocks go back to the pool.
    pub fn restore_from_checkpoint(&self, id: u64) -> ChainResult<CheckpointMeta> {
        let now = now_ms();
        let mut core = self.core.write();
        let (meta, removed) = core.store.restore_from_checkpoint(id)?;
        let mut events = vec![ChainEvent::CheckpointRestored { id: meta.id, height: meta.height }];
        self.sync_mempool(core.store.ledger(), &[], removed, now, &mut events);
        drop(core);
        self.emit_all(events);
        Ok(meta)
    }

    /// Replay canonical blocks from `from_height` (the ledger's next height).
    pub fn replay_blocks_from(&self, from_height: u64) -> ChainResult<u64> {
        self.core.write().store.replay_blocks_from(from_height)
    }

    /// Checkpoint (when past genesis) and flush storage.
    pub fn shutdown(&self) -> ChainResult<()> {
        let core = self.core.read();
        if core.store.ledger().has_genesis() {
            match core.store.create_checkpoint(now_ms()) {
                Ok(meta) => info!(id = meta.id, height = meta.height, "shutdown checkpoint written"),
                Err(e) => error!(error = %e, "shutdown checkpoint failed"),
            }
        }
        core.store.flush()?;
        info!("chain shut down");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // queries
    // ────────────────────────────────────────────────────────────────────────

    pub fn tip(&self) -> Option<(u64, Hash)> {
        self.core.read().store.tip()
    }

    pub fn get_block(&self, hash: &Hash) -> ChainResult<Option<Block>> {
        self.core.read().store.get_block(hash)
    }

    pub fn get_block_by_height(&self, height: u64) -> ChainResult<Option<Block>> {
        self.core.read().store.get_block_by_height(height)
    }

    /// Canonical blocks in `from..=to`; empty when `from > to`.
    pub fn get_blocks_range(&self, from: u64, to: u64) -> ChainResult<Vec<Block>> {
        if from > to {
            return Ok(Vec::new());
        }
        self.core.read().store.get_blocks_range(from, to)
    }

    pub fn balance_of(&self, address: &Address) -> Amount {
        self.core.read().store.ledger().balance_of(address)
    }

    pub fn nonce_of(&self, address: &Address) -> u64 {
        self.core.read().store.ledger().nonce_of(address)
    }

    pub fn stake_of(&self, address: &Address) -> Amount {
        self.core.read().store.ledger().stake_of(address)
    }

    pub fn get_validator(&self, address: &Address) -> Option<Validator> {
        self.core.read().store.ledger().get_validator(address).cloned()
    }

    /// UTXO-side balance; agrees with [`Self::balance_of`] unless an audit
    /// reports a mismatch.
    pub fn utxo_balance_of(&self, address: &Address) -> Amount {
        self.core.read().store.utxo().balance_of(address)
    }

    /// Copy of the full ledger at the current tip.
    pub fn ledger_snapshot(&self) -> ChainState {
        self.core.read().store.ledger().clone()
    }

    /// Compare UTXO index against ledger balances.
    pub fn audit_utxo(&self) -> Vec<UtxoMismatch> {
        let mismatches = self.core.read().store.audit_utxo();
        if !mismatches.is_empty() {
            warn!(count = mismatches.len(), "utxo audit found mismatches");
        }
        mismatches
    }

    pub fn current_slot(&self) -> Option<Slot> {
        self.core.read().consensus.current_slot().cloned()
    }
}

fn poll_locked(core: &mut Core, now_ms: u64) -> (SlotStatus, Vec<ChainEvent>) {
    let Core { store, consensus } = core;
    let status = consensus.poll(store.ledger_mut(), now_ms);
    let mut events = Vec::new();
    if let SlotStatus::Missed { missed, .. } = &status {
        events.push(ChainEvent::SlotMissed {
            height: missed.slot.height,
            round: missed.slot.round,
            proposer: missed.slot.proposer,
        });
        if let Some((from, to)) = missed.status_change {
            events.push(ChainEvent::ValidatorStateChanged { address: missed.slot.proposer, from, to });
        }
        // no block records a jailing, so checkpoint it
        if matches!(missed.status_change, Some((_, ValidatorStatus::Jailed))) {
            match store.create_checkpoint(now_ms) {
                Ok(meta) => events.push(ChainEvent::CheckpointCreated { id: meta.id, height: meta.height }),
                Err(e) => error!(validator = %missed.slot.proposer, error = %e, "checkpoint after jailing failed"),
            }
        }
    }
    (status, events)
}

fn push_removed(events: &mut Vec<ChainEvent>, hashes: &[Hash], reason: RemovalReason) {
    events.extend(hashes.iter().map(|hash| ChainEvent::TransactionRemoved { hash: *hash, reason }));
}
