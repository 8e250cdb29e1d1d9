//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use rpos_chain::events::{ChainEvent, ChainEventListener};
use rpos_chain::{Block, Chain, ChainConfig, Ed25519Signer, KeySigner, SlotStatus, Transaction, ValidatorStatus, SCALE};

pub const GENESIS_TS: u64 = 10_000;
pub const INTERVAL: u64 = 1_000;
pub const FEE: u128 = 2_000;

/// Keeps every event for later assertions.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<ChainEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<ChainEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&ChainEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl ChainEventListener for Recorder {
    fn on_event(&self, event: ChainEvent) {
        self.events.lock().push(event);
    }
}

/// Operator-run config with a 1 s slot and a 0.5 s proposer window.
pub fn config(operator: &Ed25519Signer) -> ChainConfig {
    let mut cfg = ChainConfig::default();
    cfg.distribution.genesis_operator = operator.address();
    cfg.consensus.block_interval_ms = INTERVAL;
    cfg.consensus.proposer_window_ms = INTERVAL / 2;
    cfg.consensus.min_stake = 10 * SCALE;
    cfg
}

pub fn memory_chain(cfg: ChainConfig) -> (Chain, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let chain = Chain::in_memory(cfg, recorder.clone()).expect("open in-memory chain");
    (chain, recorder)
}

/// Poll the slot at `now` and let whichever signer owns it produce.
pub fn produce(chain: &Chain, signers: &[&Ed25519Signer], now: u64) -> Block {
    let slot = match chain.poll_consensus(now) {
        SlotStatus::Ready(slot) => slot,
        other => panic!("slot not ready at {}: {:?}", now, other),
    };
    let signer = signers
        .iter()
        .find(|s| s.address() == slot.proposer)
        .unwrap_or_else(|| panic!("no signer for proposer {}", slot.proposer));
    chain.produce_block(*signer, now).expect("produce block")
}

/// Genesis at `GENESIS_TS`, then `n` operator blocks one interval apart.
/// Returns the timestamp of the last block.
pub fn grow(chain: &Chain, op: &Ed25519Signer, n: u64) -> u64 {
    if chain.tip().is_none() {
        chain.init_genesis(op, GENESIS_TS).expect("genesis");
    }
    let mut ts = chain.get_block_by_height(chain.tip().map(|t| t.0).unwrap_or(0)).unwrap().unwrap().header.timestamp;
    for _ in 0..n {
        ts += INTERVAL;
        produce(chain, &[op], ts);
    }
    ts
}

/// Operator funds bob with 30 and bob stakes 20 at height 3; returns the
/// last block time.
pub fn with_active_bob(chain: &Chain, op: &Ed25519Signer, bob: &Ed25519Signer) -> u64 {
    chain.init_genesis(op, GENESIS_TS).unwrap();
    produce(chain, &[op], 11_000);
    chain.submit_transaction(Transaction::transfer(bob.address(), 30 * SCALE, FEE, 1, 0, op), true).unwrap();
    produce(chain, &[op], 12_000);
    chain.submit_transaction(Transaction::stake(20 * SCALE, FEE, 1, 0, bob), true).unwrap();
    produce(chain, &[op], 13_000);
    assert_eq!(chain.get_validator(&bob.address()).unwrap().status, ValidatorStatus::Active);
    13_000
}
