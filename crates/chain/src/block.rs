//! Block structure
use serde::{Deserialize, Serialize};

use crate::crypto::{address_from_pubkey_bytes, sha3_512, sha3_512_concat, KeySigner, SignatureVerifier};
use crate::error::ValidationError;
use crate::tx::Transaction;
use crate::types::{Address, Amount, Hash};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    /// `None` only for genesis.
    pub previous_hash: Option<Hash>,
    /// Unix ms.
    pub timestamp: u64,
    pub proposer: Address,
    pub proposer_pubkey: Vec<u8>,
    /// Proposer selection round within the slot (0 unless the first proposer missed).
    pub round: u32,
    pub merkle_root: Hash,
    /// Minted amount credited to the proposer (fees not included).
    pub reward: Amount,
}

impl BlockHeader {
    /// Canonical header encoding: fixed-width LE fields, genesis flag byte.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 1 + 64 + 8 + 20 + 4 + 32 + 4 + 64 + 16);
        out.extend_from_slice(&self.height.to_le_bytes());
        match &self.previous_hash {
            Some(h) => {
                out.push(1);
                out.extend_from_slice(h.as_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.proposer.as_bytes());
        out.extend_from_slice(&(self.proposer_pubkey.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.proposer_pubkey);
        out.extend_from_slice(&self.round.to_le_bytes());
        out.extend_from_slice(self.merkle_root.as_bytes());
        out.extend_from_slice(&self.reward.to_le_bytes());
        out
    }

    pub fn compute_hash(&self) -> Hash {
        sha3_512(&self.canonical_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: Hash,
    pub signature: Vec<u8>,
    pub transactions: Vec<Transaction>,
}

/// Pairwise SHA3-512 merkle root over transaction hashes; odd node pairs with itself.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return sha3_512(b"");
    }
    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let a = pair[0];
            let b = if pair.len() == 2 { pair[1] } else { pair[0] };
            next.push(sha3_512_concat(&[a.as_bytes(), b.as_bytes()]));
        }
        level = next;
    }
    level[0]
}

impl Block {
    /// Assemble and sign a block.
    pub fn build(
        height: u64,
        previous_hash: Option<Hash>,
        timestamp: u64,
        round: u32,
        reward: Amount,
        transactions: Vec<Transaction>,
        signer: &dyn KeySigner,
    ) -> Self {
        let proposer_pubkey = signer.public_key();
        let tx_hashes: Vec<Hash> = transactions.iter().map(|t| t.hash).collect();
        let header = BlockHeader {
            height,
            previous_hash,
            timestamp,
            proposer: address_from_pubkey_bytes(&proposer_pubkey),
            proposer_pubkey,
            round,
            merkle_root: merkle_root(&tx_hashes),
            reward,
        };
        let hash = header.compute_hash();
        let signature = signer.sign(hash.as_bytes());
        Block { header, hash, signature, transactions }
    }

    /// Genesis: height 0, no parent, no transactions.
    pub fn genesis(timestamp: u64, reward: Amount, signer: &dyn KeySigner) -> Self {
        Self::build(0, None, timestamp, 0, reward, Vec::new(), signer)
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn parent(&self) -> Option<Hash> {
        self.header.previous_hash
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 0 && self.header.previous_hash.is_none()
    }

    pub fn total_fees(&self) -> Amount {
        self.transactions.iter().fold(0u128, |acc, t| acc.saturating_add(t.fee))
    }

    pub fn size_bytes(&self) -> usize {
        self.header.canonical_bytes().len()
            + self.signature.len()
            + self.transactions.iter().map(|t| t.size_bytes()).sum::<usize>()
    }

    /// Context-free checks: hash, merkle root, proposer binding, signatures.
    ///
    /// Ancestry, reward and proposer eligibility need ledger state and are
    /// checked at application time.
    pub fn validate_structure(
        &self,
        verifier: &dyn SignatureVerifier,
        max_transactions: usize,
        max_bytes: usize,
    ) -> Result<(), ValidationError> {
        let height = self.header.height;
        let malformed = |reason: &str| ValidationError::MalformedBlock { height, reason: reason.to_string() };

        if (height == 0) != self.header.previous_hash.is_none() {
            return Err(malformed("only genesis may omit previous hash"));
        }
        if self.header.compute_hash() != self.hash {
            return Err(malformed("hash does not match header"));
        }
        if address_from_pubkey_bytes(&self.header.proposer_pubkey) != self.header.proposer {
            return Err(malformed("proposer does not match public key"));
        }
        if self.transactions.len() > max_transactions {
            return Err(malformed("too many transactions"));
        }
        if self.size_bytes() > max_bytes {
            return Err(malformed("block too large"));
        }
        let tx_hashes: Vec<Hash> = self.transactions.iter().map(|t| t.hash).collect();
        if merkle_root(&tx_hashes) != self.header.merkle_root {
            return Err(ValidationError::MerkleRootMismatch(height));
        }
        let mut seen = std::collections::HashSet::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            if !seen.insert(tx.hash) {
                return Err(malformed("duplicate transaction in block"));
            }
            tx.validate(verifier)?;
        }
        if !verifier.verify(&self.header.proposer_pubkey, self.hash.as_bytes(), &self.signature) {
            return Err(ValidationError::BadBlockSignature(height));
        }
        Ok(())
    }
}
