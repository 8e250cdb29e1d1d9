//! Forks, checkpoints and restart recovery, in memory and on LMDB.

mod common;

use std::sync::Arc;

use common::*;
use rpos_chain::events::ChainEvent;
use rpos_chain::{
    Block, BlockOutcome, Chain, ChainDb, DoubleSignEvidence, Ed25519Signer, Hash, KeySigner, SlotStatus, Transaction,
    ValidatorStatus, SCALE, TREASURY_ADDRESS,
};
use tempfile::tempdir;

#[test]
fn longer_fork_reorganizes_to_replay_equivalent_state() {
    let op = Ed25519Signer::generate();
    let bob = Ed25519Signer::generate();
    let (a, recorder) = memory_chain(config(&op));
    let (b, _) = memory_chain(config(&op));

    let genesis = a.init_genesis(&op, GENESIS_TS).unwrap();
    b.add_block_at(genesis, GENESIS_TS).unwrap();

    let tx = Transaction::transfer(bob.address(), 7 * SCALE, FEE, 1, 0, &op);
    a.submit_transaction(tx.clone(), true).unwrap();
    let a1 = produce(&a, &[&op], 11_000);
    let a2 = produce(&a, &[&op], 12_000);
    assert_eq!(a.balance_of(&bob.address()), 7 * SCALE);

    let fork = vec![produce(&b, &[&op], 11_100), produce(&b, &[&op], 12_100), produce(&b, &[&op], 13_100)];
    assert!(matches!(a.add_block_at(fork[0].clone(), 13_100).unwrap(), BlockOutcome::SideChain { .. }));
    assert!(matches!(a.add_block_at(fork[1].clone(), 13_100).unwrap(), BlockOutcome::SideChain { .. }));
    match a.add_block_at(fork[2].clone(), 13_100).unwrap() {
        BlockOutcome::Reorganized(summary) => {
            assert_eq!(summary.depth, 2);
            assert_eq!(summary.common_ancestor, 0);
            assert_eq!(summary.removed, vec![a1.hash, a2.hash]);
            assert_eq!(summary.added, fork.iter().map(|f| f.hash).collect::<Vec<_>>());
        }
        other => panic!("expected reorg, got {:?}", other),
    }

    assert_eq!(a.tip(), b.tip());
    assert_eq!(a.ledger_snapshot(), b.ledger_snapshot());
    assert_eq!(a.utxo_balance_of(&op.address()), b.utxo_balance_of(&op.address()));
    assert_eq!(a.balance_of(&bob.address()), 0);
    assert!(a.audit_utxo().is_empty());
    // the dropped transfer is pending again
    assert!(a.mempool().contains(&tx.hash));
    assert_eq!(recorder.count(|e| matches!(e, ChainEvent::ChainReorganized { depth: 2, .. })), 1);
}

#[test]
fn out_of_order_blocks_wait_as_orphans() {
    let op = Ed25519Signer::generate();
    let (source, _) = memory_chain(config(&op));
    grow(&source, &op, 3);
    let blocks = source.get_blocks_range(0, 3).unwrap();

    let (sink, recorder) = memory_chain(config(&op));
    sink.add_block_at(blocks[0].clone(), 20_000).unwrap();
    assert!(matches!(sink.add_block_at(blocks[3].clone(), 20_000).unwrap(), BlockOutcome::Orphaned { .. }));
    assert!(matches!(sink.add_block_at(blocks[2].clone(), 20_000).unwrap(), BlockOutcome::Orphaned { .. }));
    assert!(sink.add_block_at(blocks[1].clone(), 20_000).unwrap().is_canonical());

    assert_eq!(sink.tip(), source.tip());
    assert_eq!(sink.ledger_snapshot(), source.ledger_snapshot());
    assert_eq!(recorder.count(|e| matches!(e, ChainEvent::BlockApplied { .. })), 4);
}

#[test]
fn checkpoint_round_trip_on_lmdb() {
    let dir = tempdir().unwrap();
    let op = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.checkpoint.interval_blocks = 0;
    let chain = Chain::open_lmdb(dir.path(), cfg, Arc::new(Recorder::default())).unwrap();

    grow(&chain, &op, 3);
    let tip = chain.tip().unwrap();
    let ledger = chain.ledger_snapshot();
    let utxo_op = chain.utxo_balance_of(&op.address());
    let meta = chain.create_checkpoint().unwrap();
    assert_eq!((meta.height, meta.tip_hash), tip);

    let last = grow(&chain, &op, 2);
    assert_eq!(chain.tip().unwrap().0, 5);

    chain.restore_from_checkpoint(meta.id).unwrap();
    assert_eq!(chain.tip(), Some(tip));
    assert_eq!(chain.ledger_snapshot(), ledger);
    assert_eq!(chain.utxo_balance_of(&op.address()), utxo_op);
    assert!(chain.get_block_by_height(4).unwrap().is_none());

    // production resumes on top of the restored tip
    produce(&chain, &[&op], last + INTERVAL);
    assert_eq!(chain.tip().unwrap().0, 4);
    assert!(chain.ledger_snapshot().is_conserved());
}

#[test]
fn restart_restores_checkpoint_replays_tail_and_reloads_pool() {
    let dir = tempdir().unwrap();
    let op = Ed25519Signer::generate();
    let bob = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.checkpoint.interval_blocks = 2;

    let (tip, ledger, pending) = {
        let chain = Chain::open_lmdb(dir.path(), cfg.clone(), Arc::new(Recorder::default())).unwrap();
        let ts = grow(&chain, &op, 1);
        chain.submit_transaction(Transaction::transfer(bob.address(), SCALE, FEE, 1, 0, &op), true).unwrap();
        produce(&chain, &[&op], ts + INTERVAL);
        produce(&chain, &[&op], ts + 2 * INTERVAL);
        let pending = Transaction::transfer(bob.address(), SCALE, FEE, 2, 0, &op);
        chain.submit_transaction(pending.clone(), true).unwrap();
        // dropped without shutdown, as after a crash
        (chain.tip().unwrap(), chain.ledger_snapshot(), pending.hash)
    };

    let recorder = Arc::new(Recorder::default());
    let chain = Chain::open_lmdb(dir.path(), cfg, recorder.clone()).unwrap();
    assert!(recorder.events().iter().any(|e| matches!(e, ChainEvent::CheckpointRestored { height: 2, .. })));
    assert_eq!(chain.tip(), Some(tip));
    assert_eq!(chain.ledger_snapshot(), ledger);
    assert!(chain.mempool().contains(&pending));
    assert!(chain.audit_utxo().is_empty());
}

#[test]
fn corrupted_index_is_rebuilt_from_the_log() {
    let dir = tempdir().unwrap();
    let op = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.checkpoint.interval_blocks = 0;

    let (tip, ledger) = {
        let chain = Chain::open_lmdb(dir.path(), cfg.clone(), Arc::new(Recorder::default())).unwrap();
        grow(&chain, &op, 4);
        chain.shutdown().unwrap();
        (chain.tip().unwrap(), chain.ledger_snapshot())
    };
    {
        let db = ChainDb::open(dir.path()).unwrap();
        db.overwrite_canonical_slot(2, &Hash::from_bytes([9; 64])).unwrap();
    }

    let recorder = Arc::new(Recorder::default());
    let chain = Chain::open_lmdb(dir.path(), cfg, recorder.clone()).unwrap();
    assert!(recorder.events().iter().any(|e| matches!(e, ChainEvent::IndexRebuilt { blocks: 5 })));
    assert_eq!(chain.tip(), Some(tip));
    assert_eq!(chain.ledger_snapshot(), ledger);
}

#[test]
fn shutdown_leaves_a_checkpoint_at_the_tip() {
    let dir = tempdir().unwrap();
    let op = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.checkpoint.interval_blocks = 0;
    let chain = Chain::open_lmdb(dir.path(), cfg, Arc::new(Recorder::default())).unwrap();
    grow(&chain, &op, 2);
    chain.shutdown().unwrap();

    let metas = chain.checkpoints().unwrap();
    assert_eq!(metas.last().map(|m| m.height), Some(2));
    let nearest = chain.get_nearest_checkpoint(10).unwrap().unwrap();
    assert_eq!(nearest.tip_hash, chain.tip().unwrap().1);
    assert_eq!(op.address(), chain.config().distribution.genesis_operator);
}

/// Equivocation by bob on top of the current tip.
fn bob_equivocates(chain: &Chain, bob: &Ed25519Signer, ts: u64) -> DoubleSignEvidence {
    let (height, parent) = chain.tip().unwrap();
    let first = Block::build(height + 1, Some(parent), ts, 0, 21 * SCALE, Vec::new(), bob);
    let second = Block::build(height + 1, Some(parent), ts + 1, 0, 21 * SCALE, Vec::new(), bob);
    DoubleSignEvidence::new(&first, &second)
}

#[test]
fn double_sign_penalty_survives_restart() {
    let dir = tempdir().unwrap();
    let op = Ed25519Signer::generate();
    let bob = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.checkpoint.interval_blocks = 0;

    let ledger = {
        let chain = Chain::open_lmdb(dir.path(), cfg.clone(), Arc::new(Recorder::default())).unwrap();
        let t = with_active_bob(&chain, &op, &bob);
        chain.report_double_sign(&bob_equivocates(&chain, &bob, t + 1_000)).unwrap();
        produce(&chain, &[&op, &bob], t + 1_000);
        chain.ledger_snapshot()
    };

    let chain = Chain::open_lmdb(dir.path(), cfg, Arc::new(Recorder::default())).unwrap();
    assert_eq!(chain.ledger_snapshot(), ledger);
    assert_eq!(chain.get_validator(&bob.address()).unwrap().status, ValidatorStatus::Tombstoned);
    assert_eq!(chain.balance_of(&TREASURY_ADDRESS), 2 * SCALE);
    assert!(chain.ledger_snapshot().is_conserved());
    assert!(chain.audit_utxo().is_empty());
}

#[test]
fn reorg_after_double_sign_reapplies_penalty_on_new_tip() {
    let op = Ed25519Signer::generate();
    let bob = Ed25519Signer::generate();
    let (a, _) = memory_chain(config(&op));
    let (b, _) = memory_chain(config(&op));
    let t = with_active_bob(&a, &op, &bob);
    let (staked_at, _) = a.tip().unwrap();
    for block in a.get_blocks_range(0, staked_at).unwrap() {
        b.add_block_at(block, t).unwrap();
    }

    produce(&a, &[&op, &bob], t + 1_000);
    a.report_double_sign(&bob_equivocates(&a, &bob, t + 2_000)).unwrap();
    assert_eq!(a.get_validator(&bob.address()).unwrap().stake, 18 * SCALE);

    let fork = vec![produce(&b, &[&op, &bob], t + 1_100), produce(&b, &[&op, &bob], t + 2_100)];
    assert!(matches!(a.add_block_at(fork[0].clone(), t + 2_100).unwrap(), BlockOutcome::SideChain { .. }));
    let outcome = a.add_block_at(fork[1].clone(), t + 2_100).unwrap();
    assert!(matches!(outcome, BlockOutcome::Reorganized(ref s) if s.common_ancestor == staked_at));

    let v = a.get_validator(&bob.address()).unwrap();
    assert_eq!(v.status, ValidatorStatus::Tombstoned);
    assert_eq!(v.stake, 18 * SCALE);
    assert_eq!(a.balance_of(&TREASURY_ADDRESS), 2 * SCALE);
    assert!(a.ledger_snapshot().is_conserved());
    assert!(a.audit_utxo().is_empty());
}

#[test]
fn reorg_past_offenders_stake_keeps_tombstone_and_supply() {
    let op = Ed25519Signer::generate();
    let bob = Ed25519Signer::generate();
    let (a, _) = memory_chain(config(&op));
    let (b, _) = memory_chain(config(&op));
    let t = with_active_bob(&a, &op, &bob);
    b.add_block_at(a.get_block_by_height(0).unwrap().unwrap(), GENESIS_TS).unwrap();
    a.report_double_sign(&bob_equivocates(&a, &bob, t + 1_000)).unwrap();

    // a longer branch on which bob never staked
    let fork: Vec<Block> = (1..=4).map(|i| produce(&b, &[&op], GENESIS_TS + i * INTERVAL + 100)).collect();
    let mut last = None;
    for block in fork {
        last = Some(a.add_block_at(block, t + 1_100).unwrap());
    }
    assert!(matches!(last, Some(BlockOutcome::Reorganized(_))));

    let v = a.get_validator(&bob.address()).unwrap();
    assert_eq!(v.status, ValidatorStatus::Tombstoned);
    assert_eq!(v.stake, 0);
    assert_eq!(a.balance_of(&TREASURY_ADDRESS), 0);
    assert!(a.ledger_snapshot().is_conserved());
    assert!(a.audit_utxo().is_empty());
}

#[test]
fn jailing_miss_survives_restart() {
    let dir = tempdir().unwrap();
    let op = Ed25519Signer::generate();
    let bob = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.checkpoint.interval_blocks = 0;
    cfg.consensus.missed_block_threshold = 2;

    let ledger = {
        let recorder = Arc::new(Recorder::default());
        let chain = Chain::open_lmdb(dir.path(), cfg.clone(), recorder.clone()).unwrap();
        let t = with_active_bob(&chain, &op, &bob);
        let (height, _) = chain.tip().unwrap();
        assert!(matches!(chain.poll_consensus(t + 1_000), SlotStatus::Ready(s) if s.proposer == bob.address()));
        assert!(matches!(chain.poll_consensus(t + 1_500), SlotStatus::Missed { .. }));
        assert!(matches!(chain.poll_consensus(t + 2_000), SlotStatus::Missed { .. }));
        assert_eq!(chain.get_validator(&bob.address()).unwrap().status, ValidatorStatus::Jailed);
        assert_eq!(recorder.count(|e| matches!(e, ChainEvent::CheckpointCreated { height: h, .. } if *h == height)), 1);
        chain.ledger_snapshot()
    };

    let chain = Chain::open_lmdb(dir.path(), cfg, Arc::new(Recorder::default())).unwrap();
    assert_eq!(chain.get_validator(&bob.address()).unwrap().status, ValidatorStatus::Jailed);
    assert_eq!(chain.ledger_snapshot(), ledger);
}
