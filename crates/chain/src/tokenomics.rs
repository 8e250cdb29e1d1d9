//! Issuance schedule.
//!
//! ```text
//! reward(h) = max(initial_reward >> floor(h / halving_interval), min_reward)
//! minted    = min(reward(h), max_supply - already_minted)
//! ```
//!
//! Once `max_supply` is reached nothing more is minted, regardless of the
//! floor.

use crate::config::RewardConfig;
use crate::types::Amount;

/// Number of halvings applied at `height`.
pub fn halvings_at(height: u64, halving_interval: u64) -> u64 {
    if halving_interval == 0 {
        return 0;
    }
    height / halving_interval
}

/// Scheduled reward at `height`, before the supply cap.
pub fn scheduled_reward(cfg: &RewardConfig, height: u64) -> Amount {
    let halvings = halvings_at(height, cfg.halving_interval);
    let halved = u32::try_from(halvings)
        .ok()
        .and_then(|h| cfg.initial_reward.checked_shr(h))
        .unwrap_or(0);
    halved.max(cfg.min_reward)
}

/// Reward actually minted at `height` given what has been minted so far.
pub fn block_reward(cfg: &RewardConfig, height: u64, minted: Amount) -> Amount {
    let remaining = cfg.max_supply.saturating_sub(minted);
    scheduled_reward(cfg, height).min(remaining)
}

/// Caps an arbitrary bonus by the remaining supply.
pub fn capped_mint(cfg: &RewardConfig, amount: Amount, minted: Amount) -> Amount {
    amount.min(cfg.max_supply.saturating_sub(minted))
}
