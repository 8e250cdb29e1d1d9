use crate::crypto::sha3_512;
use crate::types::Hash;

use super::ChainState;

impl ChainState {
    /// SHA3-512 over a fixed-order big-endian encoding of the ledger.
    /// Maps are ordered, so equal ledgers give equal roots.
    pub fn compute_state_root(&self) -> Hash {
        let mut accum = Vec::new();

        accum.extend_from_slice(&self.height.to_be_bytes());
        if let Some(h) = &self.tip_hash {
            accum.extend_from_slice(h.as_bytes());
        }
        accum.extend_from_slice(&self.last_block_timestamp.to_be_bytes());

        for (addr, bal) in &self.balances {
            accum.extend_from_slice(addr.as_bytes());
            accum.extend_from_slice(&bal.to_be_bytes());
        }
        accum.push(0xff);
        for (addr, nonce) in &self.nonces {
            accum.extend_from_slice(addr.as_bytes());
            accum.extend_from_slice(&nonce.to_be_bytes());
        }
        accum.push(0xff);
        for (addr, v) in &self.validators {
            accum.extend_from_slice(addr.as_bytes());
            accum.extend_from_slice(&v.stake.to_be_bytes());
            accum.extend_from_slice(&v.reputation.to_be_bytes());
            accum.push(v.status as u8);
            accum.extend_from_slice(&v.missed_blocks.to_be_bytes());
            accum.extend_from_slice(&v.produced_blocks.to_be_bytes());
            accum.extend_from_slice(&v.jailed_until.unwrap_or(0).to_be_bytes());
            accum.push(v.distribution_reward_claimed as u8);
        }
        accum.push(0xff);

        accum.extend_from_slice(&self.total_minted.to_be_bytes());
        for addr in &self.developer_rewarded {
            accum.extend_from_slice(addr.as_bytes());
        }
        accum.push(0xff);
        for addr in &self.early_rewarded {
            accum.extend_from_slice(addr.as_bytes());
        }
        accum.push(0xff);
        for (id, r) in &self.slashes {
            accum.extend_from_slice(id.as_bytes());
            accum.extend_from_slice(r.offender.as_bytes());
            accum.extend_from_slice(&r.seq.to_be_bytes());
            accum.extend_from_slice(&r.height.to_be_bytes());
            accum.extend_from_slice(&r.amount.to_be_bytes());
        }

        sha3_512(&accum)
    }
}
