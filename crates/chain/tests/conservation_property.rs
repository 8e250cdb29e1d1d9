//! Random histories of transfers, staking, forks, double-sign reports and
//! restarts keep supply conserved and the UTXO index in step with the ledger.

mod common;

use std::sync::Arc;

use common::*;
use quickcheck::{Arbitrary, Gen, TestResult};
use quickcheck_macros::quickcheck;
use rpos_chain::events::NoOpListener;
use rpos_chain::{
    Block, Chain, ChainConfig, DoubleSignEvidence, Ed25519Signer, Ed25519Verifier, KeySigner, MemoryStorage,
    Transaction, SCALE,
};

const USERS: usize = 3;
const MAX_STEPS: usize = 24;

#[derive(Debug, Clone)]
enum Step {
    Transfer { from: u8, to: u8, amount: u8 },
    Stake { who: u8, amount: u8 },
    Unstake { who: u8, amount: u8 },
    Produce,
    Fork { depth: u8, pay: u8 },
    DoubleSign { who: u8 },
    Restart,
}

impl Arbitrary for Step {
    fn arbitrary<G: Gen>(g: &mut G) -> Self {
        match u8::arbitrary(g) % 8 {
            0 => Step::Transfer { from: u8::arbitrary(g), to: u8::arbitrary(g), amount: u8::arbitrary(g) },
            1 | 2 => Step::Stake { who: u8::arbitrary(g), amount: u8::arbitrary(g) },
            3 => Step::Unstake { who: u8::arbitrary(g), amount: u8::arbitrary(g) },
            4 => Step::Produce,
            5 => Step::Fork { depth: u8::arbitrary(g), pay: u8::arbitrary(g) },
            6 => Step::DoubleSign { who: u8::arbitrary(g) },
            _ => Step::Restart,
        }
    }
}

/// One chain over shared storage, plus the keys that drive it.
struct World {
    cfg: ChainConfig,
    op: Ed25519Signer,
    users: Vec<Ed25519Signer>,
    storage: Arc<MemoryStorage>,
    chain: Chain,
    now: u64,
}

fn open(cfg: &ChainConfig, storage: &Arc<MemoryStorage>) -> Chain {
    Chain::open(
        cfg.clone(),
        Arc::new(Ed25519Verifier),
        storage.clone(),
        storage.clone(),
        Some(storage.clone()),
        Arc::new(NoOpListener),
    )
    .expect("open chain over shared storage")
}

/// Produce the next block on `chain` as the operator. A slot left open by
/// an earlier poll may have expired; the retry lands in the next round.
fn produce_as_operator(chain: &Chain, op: &Ed25519Signer, now: u64) -> Block {
    let mut last = None;
    for _ in 0..3 {
        match chain.produce_block(op, now) {
            Ok(block) => return block,
            Err(e) => last = Some(e),
        }
    }
    panic!("operator could not produce at {}: {:?}", now, last);
}

impl World {
    fn new() -> Self {
        let op = Ed25519Signer::generate();
        let mut cfg = config(&op);
        // never leave bootstrap, so the operator owns every slot
        cfg.consensus.min_validators = 64;
        cfg.checkpoint.interval_blocks = 2;
        cfg.checkpoint.max_checkpoints = 4;
        cfg.checkpoint.max_reorg_depth = 2;
        let storage = Arc::new(MemoryStorage::new());
        let chain = open(&cfg, &storage);
        chain.init_genesis(&op, GENESIS_TS).expect("genesis");
        let users = (0..USERS).map(|_| Ed25519Signer::generate()).collect();
        let mut world = Self { cfg, op, users, storage, chain, now: GENESIS_TS };

        // enough for everyone to stake
        for _ in 0..3 {
            world.produce();
        }
        for (i, user) in world.users.iter().enumerate() {
            let tx = Transaction::transfer(user.address(), 15 * SCALE, FEE, i as u64 + 1, world.now, &world.op);
            world.chain.submit_transaction(tx, true).expect("funding transfer");
        }
        world.produce();
        world
    }

    fn user(&self, pick: u8) -> &Ed25519Signer {
        &self.users[pick as usize % USERS]
    }

    fn next_nonce(&self, signer: &Ed25519Signer) -> u64 {
        self.chain.nonce_of(&signer.address()) + 1
    }

    fn produce(&mut self) -> Block {
        self.now += INTERVAL;
        produce_as_operator(&self.chain, &self.op, self.now)
    }

    /// Submit, then produce. Rejected submissions are part of the game.
    fn submit_and_produce(&mut self, tx: Transaction) {
        let _ = self.chain.submit_transaction(tx, true);
        self.produce();
    }

    fn run(&mut self, step: &Step) {
        match *step {
            Step::Transfer { from, to, amount } => {
                let sender = self.user(from).clone();
                let recipient = self.user(to).address();
                let tx = Transaction::transfer(
                    recipient,
                    amount as u128 * SCALE / 16,
                    FEE,
                    self.next_nonce(&sender),
                    self.now,
                    &sender,
                );
                self.submit_and_produce(tx);
            }
            Step::Stake { who, amount } => {
                let staker = self.user(who).clone();
                let amount = (8 + amount as u128 % 6) * SCALE;
                let tx = Transaction::stake(amount, FEE, self.next_nonce(&staker), self.now, &staker);
                self.submit_and_produce(tx);
            }
            Step::Unstake { who, amount } => {
                let staker = self.user(who).clone();
                let amount = (1 + amount as u128 % 4) * SCALE;
                let tx = Transaction::unstake(amount, FEE, self.next_nonce(&staker), self.now, &staker);
                self.submit_and_produce(tx);
            }
            Step::Produce => {
                self.produce();
            }
            Step::Fork { depth, pay } => self.fork(1 + depth as u64 % 3, pay),
            Step::DoubleSign { who } => {
                let offender = self.user(who).clone();
                let (height, parent) = self.chain.tip().expect("tip");
                let first = Block::build(height + 1, Some(parent), self.now + 1, 0, 21 * SCALE, Vec::new(), &offender);
                let second = Block::build(height + 1, Some(parent), self.now + 2, 0, 21 * SCALE, Vec::new(), &offender);
                // non-validators and tombstones are refused
                let _ = self.chain.report_double_sign(&DoubleSignEvidence::new(&first, &second));
            }
            Step::Restart => {
                let ledger = self.chain.ledger_snapshot();
                self.chain = open(&self.cfg, &self.storage);
                assert_eq!(self.chain.ledger_snapshot(), ledger, "ledger changed across restart");
            }
        }
    }

    /// Build a branch `depth + 1` blocks long from `depth` below the tip on a
    /// second node, optionally paying a user on it, then hand it over.
    fn fork(&mut self, depth: u64, pay: u8) {
        let (tip, _) = self.chain.tip().expect("tip");
        if tip < depth {
            return;
        }
        let other = Chain::in_memory(self.cfg.clone(), Arc::new(NoOpListener)).expect("second node");
        for block in self.chain.get_blocks_range(0, tip - depth).expect("shared prefix") {
            other.add_block_at(block, self.now).expect("replay shared prefix");
        }
        if pay % 2 == 1 {
            let recipient = self.user(pay).address();
            let nonce = other.nonce_of(&self.op.address()) + 1;
            let tx = Transaction::transfer(recipient, SCALE, FEE, nonce, self.now, &self.op);
            let _ = other.submit_transaction(tx, true);
        }
        let mut branch = Vec::new();
        for _ in 0..=depth {
            self.now += INTERVAL;
            branch.push(produce_as_operator(&other, &self.op, self.now));
        }
        for block in branch {
            self.chain.add_block_at(block, self.now).expect("branch block accepted");
        }
        assert_eq!(self.chain.tip(), other.tip(), "longer branch did not win");
    }

    fn check(&self) -> Result<(), String> {
        let ledger = self.chain.ledger_snapshot();
        if !ledger.is_conserved() {
            return Err(format!("supply not conserved at height {}", ledger.height));
        }
        let mismatches = self.chain.audit_utxo();
        if !mismatches.is_empty() {
            return Err(format!("utxo index disagrees at height {}: {:?}", ledger.height, mismatches));
        }
        Ok(())
    }
}

#[quickcheck]
fn random_histories_conserve_supply(steps: Vec<Step>) -> TestResult {
    let mut world = World::new();
    for (i, step) in steps.iter().take(MAX_STEPS).enumerate() {
        world.run(step);
        if let Err(reason) = world.check() {
            return TestResult::error(format!("after step {} ({:?}): {}", i, step, reason));
        }
    }
    TestResult::passed()
}
