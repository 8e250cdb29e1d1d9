//! End-to-end ledger behaviour driven through `Chain`.

mod common;

use common::*;
use rpos_chain::events::ChainEvent;
use rpos_chain::state::BonusKind;
use rpos_chain::{
    Block, ChainError, DoubleSignEvidence, Ed25519Signer, KeySigner, SlotStatus, StateError, Transaction,
    ValidatorStatus, SCALE, TREASURY_ADDRESS,
};

#[test]
fn reward_halves_on_schedule_and_supply_is_conserved() {
    let op = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.reward.halving_interval = 2;
    let (chain, _) = memory_chain(cfg);
    grow(&chain, &op, 4);

    let rewards: Vec<u128> =
        chain.get_blocks_range(0, 4).unwrap().iter().map(|b| b.header.reward).collect();
    assert_eq!(rewards, vec![21 * SCALE, 21 * SCALE, 1_050_000_000, 1_050_000_000, 525_000_000]);

    let ledger = chain.ledger_snapshot();
    assert_eq!(ledger.total_minted, rewards.iter().sum::<u128>());
    assert!(ledger.is_conserved());
    assert!(chain.audit_utxo().is_empty());
}

#[test]
fn issuance_stops_at_max_supply() {
    let op = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.reward.max_supply = 50 * SCALE;
    let (chain, _) = memory_chain(cfg);
    grow(&chain, &op, 3);

    let rewards: Vec<u128> =
        chain.get_blocks_range(0, 3).unwrap().iter().map(|b| b.header.reward).collect();
    assert_eq!(rewards, vec![21 * SCALE, 21 * SCALE, 8 * SCALE, 0]);
    assert_eq!(chain.balance_of(&op.address()), 50 * SCALE);
    assert!(chain.ledger_snapshot().is_conserved());
}

#[test]
fn transfers_move_value_and_nonces_only_increase() {
    let op = Ed25519Signer::generate();
    let (chain, _) = memory_chain(config(&op));
    let ts = grow(&chain, &op, 0);
    let bob = Ed25519Signer::generate();

    chain.submit_transaction(Transaction::transfer(bob.address(), 5 * SCALE, FEE, 1, ts, &op), true).unwrap();
    produce(&chain, &[&op], ts + INTERVAL);
    assert_eq!(chain.balance_of(&bob.address()), 5 * SCALE);
    assert_eq!(chain.nonce_of(&op.address()), 1);

    let replay = Transaction::transfer(bob.address(), 5 * SCALE, FEE, 1, ts + 1, &op);
    assert!(chain.submit_transaction(replay, false).is_err());

    let overdraw = Transaction::transfer(op.address(), 6 * SCALE, FEE, 1, ts, &bob);
    assert!(matches!(
        chain.submit_transaction(overdraw, false),
        Err(ChainError::State(StateError::InsufficientBalance { .. }))
    ));
}

#[test]
fn distribution_bonuses_are_one_time_and_window_bound() {
    let op = Ed25519Signer::generate();
    let bob = Ed25519Signer::generate();
    let carol = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.distribution.start_ms = 0;
    cfg.distribution.end_ms = 20_000;
    cfg.distribution.developer_bonus = 1_000 * SCALE;
    cfg.distribution.early_validator_bonus = 100 * SCALE;
    let (chain, recorder) = memory_chain(cfg);

    chain.init_genesis(&op, GENESIS_TS).unwrap();
    assert_eq!(chain.balance_of(&op.address()), 1_021 * SCALE);

    chain.submit_transaction(Transaction::transfer(bob.address(), 50 * SCALE, FEE, 1, 0, &op), true).unwrap();
    produce(&chain, &[&op], 11_000);
    chain.submit_transaction(Transaction::stake(10 * SCALE, FEE, 1, 0, &bob), true).unwrap();
    produce(&chain, &[&op], 12_000);

    assert_eq!(chain.get_validator(&bob.address()).unwrap().status, ValidatorStatus::Active);
    assert_eq!(chain.balance_of(&bob.address()), 140 * SCALE - FEE);

    // bob is now the only weighted validator and proposes
    produce(&chain, &[&op, &bob], 13_000);

    chain.submit_transaction(Transaction::transfer(carol.address(), 20 * SCALE, FEE, 2, 0, &op), true).unwrap();
    produce(&chain, &[&op, &bob], 20_000);
    chain.submit_transaction(Transaction::stake(10 * SCALE, FEE, 1, 0, &carol), true).unwrap();
    produce(&chain, &[&op, &bob], 21_000);

    assert_eq!(chain.get_validator(&carol.address()).unwrap().status, ValidatorStatus::Active);
    assert_eq!(chain.balance_of(&carol.address()), 10 * SCALE - FEE);

    let dev = recorder.count(|e| matches!(e, ChainEvent::BonusAwarded { kind: BonusKind::Developer, .. }));
    let early = recorder.count(|e| matches!(e, ChainEvent::BonusAwarded { kind: BonusKind::EarlyValidator, .. }));
    assert_eq!((dev, early), (1, 1));
    assert!(chain.ledger_snapshot().is_conserved());
}

#[test]
fn missed_slots_jail_and_unjail_restores() {
    let op = Ed25519Signer::generate();
    let bob = Ed25519Signer::generate();
    let mut cfg = config(&op);
    cfg.consensus.missed_block_threshold = 2;
    cfg.consensus.jail_duration_ms = 1_000;
    let (chain, recorder) = memory_chain(cfg);
    let t = with_active_bob(&chain, &op, &bob);

    assert!(matches!(chain.poll_consensus(t + 1_000), SlotStatus::Ready(s) if s.proposer == bob.address()));
    assert!(matches!(chain.poll_consensus(t + 1_500), SlotStatus::Missed { .. }));
    match chain.poll_consensus(t + 2_000) {
        SlotStatus::Missed { missed, next: Some(next) } => {
            assert_eq!(missed.status_change, Some((ValidatorStatus::Active, ValidatorStatus::Jailed)));
            assert_eq!(next.proposer, op.address());
        }
        other => panic!("expected jailing miss, got {:?}", other),
    }
    assert_eq!(chain.get_validator(&bob.address()).unwrap().status, ValidatorStatus::Jailed);

    // operator covers while bob sits out
    produce(&chain, &[&op, &bob], t + 2_000);
    chain.submit_transaction(Transaction::unjail(FEE, 2, 0, &bob), true).unwrap();
    produce(&chain, &[&op, &bob], t + 3_200);

    let v = chain.get_validator(&bob.address()).unwrap();
    assert_eq!(v.status, ValidatorStatus::Active);
    assert_eq!(v.missed_blocks, 0);
    assert_eq!(recorder.count(|e| matches!(e, ChainEvent::SlotMissed { .. })), 2);
    assert!(recorder.events().iter().any(|e| matches!(
        e,
        ChainEvent::ValidatorStateChanged { from: ValidatorStatus::Jailed, to: ValidatorStatus::Active, .. }
    )));
}

#[test]
fn double_sign_slashes_and_tombstones() {
    let op = Ed25519Signer::generate();
    let bob = Ed25519Signer::generate();
    let (chain, recorder) = memory_chain(config(&op));
    let t = with_active_bob(&chain, &op, &bob);
    let (height, parent) = chain.tip().unwrap();

    let first = Block::build(height + 1, Some(parent), t + 1_000, 0, 21 * SCALE, Vec::new(), &bob);
    let second = Block::build(height + 1, Some(parent), t + 1_001, 0, 21 * SCALE, Vec::new(), &bob);
    let report = chain.report_double_sign(&DoubleSignEvidence::new(&first, &second)).unwrap();

    assert_eq!(report.slashed, 2 * SCALE);
    assert_eq!(report.remaining_stake, 18 * SCALE);
    assert_eq!(chain.get_validator(&bob.address()).unwrap().status, ValidatorStatus::Tombstoned);
    assert_eq!(chain.balance_of(&TREASURY_ADDRESS), 2 * SCALE);
    assert!(chain.ledger_snapshot().is_conserved());
    assert!(chain.audit_utxo().is_empty());
    assert_eq!(recorder.count(|e| matches!(e, ChainEvent::ValidatorSlashed { .. })), 1);

    // tombstoned is terminal: neither a second report nor a restake works
    assert!(chain.report_double_sign(&DoubleSignEvidence::new(&first, &second)).is_err());
    chain.submit_transaction(Transaction::stake(SCALE, FEE, 2, 0, &bob), true).unwrap();
    let block = produce(&chain, &[&op, &bob], t + 1_000);
    assert!(block.transactions.is_empty());
}
