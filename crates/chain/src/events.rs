//! Chain events.
//!
//! Events are passive observations: listeners never change chain state and
//! the mutation path never waits on them. A listener must not block; the
//! channel listener drops events when its buffer is full.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::mempool::RemovalReason;
use crate::state::BonusKind;
use crate::types::{Address, Amount, Hash};
use crate::validator::ValidatorStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    BlockApplied {
        height: u64,
        hash: Hash,
        proposer: Address,
        tx_count: usize,
        reward: Amount,
        fees: Amount,
    },
    BlockRejected {
        height: u64,
        hash: Hash,
        reason: String,
    },
    BlockOrphaned {
        height: u64,
        hash: Hash,
    },
    SideChainStored {
        height: u64,
        hash: Hash,
    },
    ChainReorganized {
        depth: u64,
        common_ancestor: u64,
        removed: Vec<Hash>,
        added: Vec<Hash>,
    },
    TransactionAdded {
        hash: Hash,
        broadcast: bool,
    },
    TransactionRemoved {
        hash: Hash,
        reason: RemovalReason,
    },
    ValidatorStateChanged {
        address: Address,
        from: ValidatorStatus,
        to: ValidatorStatus,
    },
    ValidatorSlashed {
        address: Address,
        amount: Amount,
    },
    SlotMissed {
        height: u64,
        round: u32,
        proposer: Address,
    },
    BonusAwarded {
        address: Address,
        kind: BonusKind,
        amount: Amount,
    },
    CheckpointCreated {
        id: u64,
        height: u64,
    },
    CheckpointRestored {
        id: u64,
        height: u64,
    },
    IndexRebuilt {
        blocks: u64,
    },
    /// Block log unusable; the store was wiped back to pre-genesis.
    StoreReset {
        reason: String,
    },
    UtxoReconciled {
        height: u64,
        mismatches: usize,
    },
}

impl ChainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::BlockApplied { .. } => "BlockApplied",
            ChainEvent::BlockRejected { .. } => "BlockRejected",
            ChainEvent::BlockOrphaned { .. } => "BlockOrphaned",
            ChainEvent::SideChainStored { .. } => "SideChainStored",
            ChainEvent::ChainReorganized { .. } => "ChainReorganized",
            ChainEvent::TransactionAdded { .. } => "TransactionAdded",
            ChainEvent::TransactionRemoved { .. } => "TransactionRemoved",
            ChainEvent::ValidatorStateChanged { .. } => "ValidatorStateChanged",
            ChainEvent::ValidatorSlashed { .. } => "ValidatorSlashed",
            ChainEvent::SlotMissed { .. } => "SlotMissed",
            ChainEvent::BonusAwarded { .. } => "BonusAwarded",
            ChainEvent::CheckpointCreated { .. } => "CheckpointCreated",
            ChainEvent::CheckpointRestored { .. } => "CheckpointRestored",
            ChainEvent::IndexRebuilt { .. } => "IndexRebuilt",
            ChainEvent::StoreReset { .. } => "StoreReset",
            ChainEvent::UtxoReconciled { .. } => "UtxoReconciled",
        }
    }

    /// Events an operator should look at.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            ChainEvent::BlockRejected { .. }
                | ChainEvent::ValidatorSlashed { .. }
                | ChainEvent::IndexRebuilt { .. }
                | ChainEvent::StoreReset { .. }
                | ChainEvent::UtxoReconciled { .. }
        )
    }
}

impl Display for ChainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainEvent::BlockApplied { height, hash, tx_count, .. } => {
                write!(f, "BlockApplied(height={}, hash={}, txs={})", height, hash.short(), tx_count)
            }
            ChainEvent::ChainReorganized { depth, removed, added, .. } => {
                write!(f, "ChainReorganized(depth={}, removed={}, added={})", depth, removed.len(), added.len())
            }
            ChainEvent::TransactionRemoved { hash, reason } => {
                write!(f, "TransactionRemoved(hash={}, reason={})", hash.short(), reason)
            }
            ChainEvent::ValidatorStateChanged { address, from, to } => {
                write!(f, "ValidatorStateChanged({}: {} -> {})", address, from, to)
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Event sink. Must not panic, must not block.
pub trait ChainEventListener: Send + Sync {
    fn on_event(&self, event: ChainEvent);
}

// ════════════════════════════════════════════════════════════════════════════
// LOGGING LISTENER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl ChainEventListener for LoggingListener {
    fn on_event(&self, event: ChainEvent) {
        match &event {
            ChainEvent::BlockApplied { height, hash, proposer, tx_count, reward, fees } => {
                info!(height, hash = %hash.short(), %proposer, txs = tx_count, reward, fees, "block applied");
            }
            ChainEvent::BlockRejected { height, hash, reason } => {
                warn!(height, hash = %hash.short(), %reason, "block rejected");
            }
            ChainEvent::ChainReorganized { depth, common_ancestor, removed, added } => {
                warn!(depth, common_ancestor, removed = removed.len(), added = added.len(), "chain reorganized");
            }
            ChainEvent::ValidatorStateChanged { address, from, to } => {
                info!(validator = %address, %from, %to, "validator state changed");
            }
            ChainEvent::ValidatorSlashed { address, amount } => {
                warn!(validator = %address, amount, "validator slashed");
            }
            ChainEvent::IndexRebuilt { blocks } => {
                warn!(blocks, "block index rebuilt from log");
            }
            ChainEvent::StoreReset { reason } => {
                error!(%reason, "block store reset");
            }
            ChainEvent::UtxoReconciled { height, mismatches } => {
                warn!(height, mismatches, "utxo index reconciled toward ledger");
            }
            other => debug!(event = %other, "chain event"),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// NO-OP LISTENER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpListener;

impl ChainEventListener for NoOpListener {
    fn on_event(&self, _event: ChainEvent) {}
}

// ════════════════════════════════════════════════════════════════════════════
// COMPOSITE LISTENER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn ChainEventListener>>,
}

impl CompositeListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ChainEventListener>) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl ChainEventListener for CompositeListener {
    fn on_event(&self, event: ChainEvent) {
        for listener in &self.listeners {
            listener.on_event(event.clone());
        }
    }
}

impl fmt::Debug for CompositeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeListener").field("listener_count", &self.listeners.len()).finish()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CHANNEL LISTENER
// ════════════════════════════════════════════════════════════════════════════

/// Forwards events into a bounded tokio channel with `try_send`.
/// A full or closed channel drops the event and bumps `dropped()`.
#[derive(Debug)]
pub struct ChannelListener {
    tx: mpsc::Sender<ChainEvent>,
    dropped: AtomicU64,
}

impl ChannelListener {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChainEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, dropped: AtomicU64::new(0) }, rx)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ChainEventListener for ChannelListener {
    fn on_event(&self, event: ChainEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n.is_power_of_two() {
                warn!(dropped = n, reason = %e, "event subscriber lagging, events dropped");
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// EVENT EMITTER
// ════════════════════════════════════════════════════════════════════════════

pub struct EventEmitter {
    listener: Arc<dyn ChainEventListener>,
}

impl EventEmitter {
    pub fn new(listener: Arc<dyn ChainEventListener>) -> Self {
        Self { listener }
    }

    pub fn noop() -> Self {
        Self { listener: Arc::new(NoOpListener) }
    }

    pub fn emit(&self, event: ChainEvent) {
        self.listener.on_event(event);
    }

    pub fn transaction_removed(&self, hashes: &[Hash], reason: RemovalReason) {
        for hash in hashes {
            self.emit(ChainEvent::TransactionRemoved { hash: *hash, reason });
        }
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter").finish()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener {
        counter: Arc<AtomicUsize>,
    }

    impl ChainEventListener for CountingListener {
        fn on_event(&self, _event: ChainEvent) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn composite_fans_out() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut composite = CompositeListener::new();
        composite.add_listener(Arc::new(CountingListener { counter: counter.clone() }));
        composite.add_listener(Arc::new(CountingListener { counter: counter.clone() }));
        composite.add_listener(Arc::new(LoggingListener));

        composite.on_event(ChainEvent::IndexRebuilt { blocks: 3 });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(composite.listener_count(), 3);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (listener, mut rx) = ChannelListener::new(1);
        listener.on_event(ChainEvent::CheckpointCreated { id: 0, height: 10 });
        listener.on_event(ChainEvent::CheckpointCreated { id: 1, height: 20 });
        assert_eq!(listener.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap(), ChainEvent::CheckpointCreated { id: 0, height: 10 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_channel_is_harmless() {
        let (listener, rx) = ChannelListener::new(4);
        drop(rx);
        listener.on_event(ChainEvent::IndexRebuilt { blocks: 1 });
        assert_eq!(listener.dropped(), 1);
    }
}
