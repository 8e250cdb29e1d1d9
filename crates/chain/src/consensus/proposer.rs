//! Proposer selection.
//!
//! Weighted pick over eligible validators, seeded by
//! `SHA3-512(parent_hash || height || round)`. Weight is
//! `stake * (1000 + reputation) / 1000` (`Validator::selection_weight`).
//!
//! While fewer than `min_validators` validators are eligible the chain is in
//! bootstrap mode and the genesis operator proposes every slot.

use crate::config::ChainConfig;
use crate::crypto::sha3_512_concat;
use crate::error::ConsensusError;
use crate::state::ChainState;
use crate::types::{Address, Hash};

/// Seed for `(parent, height, round)`.
pub fn selection_seed(parent: &Hash, height: u64, round: u32) -> Hash {
    sha3_512_concat(&[parent.as_bytes(), &height.to_be_bytes(), &round.to_be_bytes()])
}

/// Eligible validators with their selection weight, ordered by address.
/// Zero-weight entries are dropped.
pub fn compute_stake_weights(state: &ChainState, cfg: &ChainConfig) -> Vec<(Address, u128)> {
    state
        .eligible_validators(cfg.consensus.min_stake)
        .into_iter()
        .map(|v| (v.address, v.selection_weight()))
        .filter(|(_, w)| *w > 0)
        .collect()
}

/// First 16 bytes of the seed as a big-endian integer.
fn seed_point(seed: &Hash) -> u128 {
    let mut arr = [0u8; 16];
    arr.copy_from_slice(&seed.as_bytes()[..16]);
    u128::from_be_bytes(arr)
}

/// Cumulative-weight walk: the validator whose range contains
/// `seed mod total_weight`.
pub fn choose_proposer(seed: &Hash, weighted_list: &[(Address, u128)]) -> Option<Address> {
    match weighted_list {
        [] => return None,
        [(only, _)] => return Some(*only),
        _ => {}
    }
    let total_weight = weighted_list.iter().fold(0u128, |acc, (_, w)| acc.saturating_add(*w));
    if total_weight == 0 {
        return None;
    }

    let selection_point = seed_point(seed) % total_weight;
    let mut cumulative: u128 = 0;
    for (addr, weight) in weighted_list {
        cumulative = cumulative.saturating_add(*weight);
        if selection_point < cumulative {
            return Some(*addr);
        }
    }
    weighted_list.last().map(|(a, _)| *a)
}

/// Proposer entitled to the slot `(height, round)` on top of `parent`.
///
/// ## Errors
/// - `ValidatorSetTooSmall` when below `min_validators` and no genesis
///   operator is configured
/// - `NoEligibleProposer` when every eligible validator has zero weight
pub fn expected_proposer(
    state: &ChainState,
    cfg: &ChainConfig,
    parent: &Hash,
    height: u64,
    round: u32,
) -> Result<Address, ConsensusError> {
    let weighted = compute_stake_weights(state, cfg);
    let required = cfg.consensus.min_validators;
    if weighted.len() < required {
        let operator = cfg.distribution.genesis_operator;
        if operator == Address::ZERO {
            return Err(ConsensusError::ValidatorSetTooSmall { active: weighted.len(), required });
        }
        return Ok(operator);
    }
    let seed = selection_seed(parent, height, round);
    choose_proposer(&seed, &weighted).ok_or(ConsensusError::NoEligibleProposer(height))
}

/// Whether the chain is still relying on the genesis operator.
pub fn in_bootstrap(state: &ChainState, cfg: &ChainConfig) -> bool {
    compute_stake_weights(state, cfg).len() < cfg.consensus.min_validators
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SCALE;
    use crate::validator::{Validator, ValidatorStatus};

    fn with_validators(stakes: &[(u8, u128, u32)]) -> ChainState {
        let mut state = ChainState::new();
        for (b, stake, rep) in stakes {
            let addr = Address::from_bytes([*b; 20]);
            let mut v = Validator::new(addr, *rep);
            v.stake = *stake;
            v.status = ValidatorStatus::Active;
            state.validators.insert(addr, v);
        }
        state
    }

    #[test]
    fn seed_point_reads_leading_bytes() {
        let mut raw = [0u8; 64];
        raw[15] = 0x2a;
        assert_eq!(seed_point(&Hash::from_bytes(raw)), 0x2a);
    }

    #[test]
    fn single_validator_always_chosen() {
        let addr = Address::from_bytes([0x01; 20]);
        assert_eq!(choose_proposer(&Hash::ZERO, &[(addr, 1000)]), Some(addr));
        assert_eq!(choose_proposer(&Hash::ZERO, &[]), None);
    }

    #[test]
    fn selection_is_deterministic_and_round_sensitive() {
        let state = with_validators(&[(1, 100 * SCALE, 500), (2, 100 * SCALE, 500), (3, 100 * SCALE, 500)]);
        let cfg = ChainConfig::default();
        let parent = Hash::from_bytes([7; 64]);
        let a = expected_proposer(&state, &cfg, &parent, 5, 0).unwrap();
        assert_eq!(a, expected_proposer(&state, &cfg, &parent, 5, 0).unwrap());

        let mut distinct = std::collections::BTreeSet::new();
        for round in 0..32 {
            distinct.insert(expected_proposer(&state, &cfg, &parent, 5, round).unwrap());
        }
        assert!(distinct.len() > 1);
    }

    #[test]
    fn reputation_shifts_share() {
        // equal stake, reputation 0 vs 1000: weights 1x vs 2x
        let state = with_validators(&[(1, 100 * SCALE, 0), (2, 100 * SCALE, 1000)]);
        let mut cfg = ChainConfig::default();
        cfg.consensus.min_validators = 2;
        let high = Address::from_bytes([2; 20]);
        let parent = Hash::from_bytes([9; 64]);
        let wins = (0..3000u64)
            .filter(|h| expected_proposer(&state, &cfg, &parent, *h, 0).unwrap() == high)
            .count();
        assert!((1800..2200).contains(&wins), "high-reputation wins: {}", wins);
    }

    #[test]
    fn bootstrap_falls_back_to_operator() {
        let state = ChainState::new();
        let mut cfg = ChainConfig::default();
        let err = expected_proposer(&state, &cfg, &Hash::ZERO, 1, 0).unwrap_err();
        assert_eq!(err, ConsensusError::ValidatorSetTooSmall { active: 0, required: 1 });

        cfg.distribution.genesis_operator = Address::from_bytes([0xAA; 20]);
        assert_eq!(expected_proposer(&state, &cfg, &Hash::ZERO, 1, 3).unwrap(), cfg.distribution.genesis_operator);
        assert!(in_bootstrap(&state, &cfg));
    }

    #[test]
    fn jailed_and_understaked_are_skipped() {
        let mut state = with_validators(&[(1, 100 * SCALE, 500), (2, SCALE, 500), (3, 100 * SCALE, 500)]);
        state.validators.get_mut(&Address::from_bytes([1; 20])).unwrap().status = ValidatorStatus::Jailed;
        let cfg = ChainConfig::default();
        let weights = compute_stake_weights(&state, &cfg);
        assert_eq!(weights.len(), 1);
        assert_eq!(weights[0].0, Address::from_bytes([3; 20]));
    }
}
