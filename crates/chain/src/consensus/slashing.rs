//! Double-sign evidence.
//!
//! Two headers signed by the same proposer for the same height with
//! different hashes prove equivocation. Verified evidence leads to
//! `ChainState::slash_double_sign`: reputation to the floor, a share of
//! stake to the treasury, and a tombstone.
//!
//! Accepted evidence is stored as an [`EvidenceRecord`] so the penalty is
//! enforced again whenever the ledger is rebuilt from blocks.

use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockHeader};
use crate::crypto::{address_from_pubkey_bytes, sha3_512_concat, SignatureVerifier};
use crate::error::ValidationError;
use crate::types::{Address, Hash};

/// A header with the hash and signature its proposer published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHeader {
    pub header: BlockHeader,
    pub hash: Hash,
    pub signature: Vec<u8>,
}

impl SignedHeader {
    pub fn from_block(block: &Block) -> Self {
        Self { header: block.header.clone(), hash: block.hash, signature: block.signature.clone() }
    }

    fn verify(&self, verifier: &dyn SignatureVerifier) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidEvidence(reason.to_string());
        if self.header.compute_hash() != self.hash {
            return Err(invalid("hash does not match header"));
        }
        if address_from_pubkey_bytes(&self.header.proposer_pubkey) != self.header.proposer {
            return Err(invalid("proposer does not match public key"));
        }
        if !verifier.verify(&self.header.proposer_pubkey, self.hash.as_bytes(), &self.signature) {
            return Err(invalid("bad proposer signature"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleSignEvidence {
    pub first: SignedHeader,
    pub second: SignedHeader,
}

impl DoubleSignEvidence {
    pub fn new(first: &Block, second: &Block) -> Self {
        Self { first: SignedHeader::from_block(first), second: SignedHeader::from_block(second) }
    }

    pub fn height(&self) -> u64 {
        self.first.header.height
    }

    /// Stable identifier; also the txid of the treasury output.
    pub fn id(&self) -> Hash {
        sha3_512_concat(&[&b"evidence"[..], self.first.hash.as_bytes(), self.second.hash.as_bytes()])
    }

    /// Check the evidence and return the offender.
    pub fn verify(&self, verifier: &dyn SignatureVerifier) -> Result<Address, ValidationError> {
        let (a, b) = (&self.first, &self.second);
        if a.header.height != b.header.height {
            return Err(ValidationError::InvalidEvidence("headers at different heights".to_string()));
        }
        if a.header.proposer != b.header.proposer {
            return Err(ValidationError::InvalidEvidence("headers from different proposers".to_string()));
        }
        if a.hash == b.hash {
            return Err(ValidationError::InvalidEvidence("headers are identical".to_string()));
        }
        a.verify(verifier)?;
        b.verify(verifier)?;
        Ok(a.header.proposer)
    }
}

/// Accepted evidence as persisted next to the block log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: Hash,
    /// Acceptance order.
    pub seq: u64,
    pub offender: Address,
    /// Ledger height the penalty is enforced at.
    pub height: u64,
    pub evidence: DoubleSignEvidence,
}
