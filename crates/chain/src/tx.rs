//! transaction type, canonical encoding, signing / id helpers
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::crypto::{address_from_pubkey_bytes, sha3_512_concat, KeySigner, SignatureVerifier};
use crate::error::ValidationError;
use crate::types::{Address, Amount, Hash};

const ED25519_PUBKEY_LEN: usize = 32;
const ED25519_SIG_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    /// sender -> recipient value transfer
    Transfer,
    /// move `amount` from the sender's balance into its stake
    Stake,
    /// move `amount` from the sender's stake back to its balance
    Unstake,
    /// explicit unjail request; `amount` must be zero
    Unjail,
}

impl TxKind {
    fn tag(self) -> u8 {
        match self {
            TxKind::Transfer => 0,
            TxKind::Stake => 1,
            TxKind::Unstake => 2,
            TxKind::Unjail => 3,
        }
    }
}

/// A signed transaction. Immutable once signed; `hash` covers every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash,
    pub kind: TxKind,
    pub sender: Address,
    pub recipient: Address,
    pub amount: Amount,
    pub fee: Amount,
    pub nonce: u64,
    /// Unix ms at signing time.
    pub timestamp: u64,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Build and sign. `sender` is derived from the signer's public key.
    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        kind: TxKind,
        recipient: Address,
        amount: Amount,
        fee: Amount,
        nonce: u64,
        timestamp: u64,
        signer: &dyn KeySigner,
    ) -> Self {
        let public_key = signer.public_key();
        let mut tx = Transaction {
            hash: Hash::ZERO,
            kind,
            sender: address_from_pubkey_bytes(&public_key),
            recipient,
            amount,
            fee,
            nonce,
            timestamp,
            public_key,
            signature: Vec::new(),
        };
        tx.signature = signer.sign(&tx.signing_bytes());
        tx.hash = tx.compute_hash();
        tx
    }

    pub fn transfer(
        recipient: Address,
        amount: Amount,
        fee: Amount,
        nonce: u64,
        timestamp: u64,
        signer: &dyn KeySigner,
    ) -> Self {
        Self::signed(TxKind::Transfer, recipient, amount, fee, nonce, timestamp, signer)
    }

    pub fn stake(amount: Amount, fee: Amount, nonce: u64, timestamp: u64, signer: &dyn KeySigner) -> Self {
        let me = signer.address();
        Self::signed(TxKind::Stake, me, amount, fee, nonce, timestamp, signer)
    }

    pub fn unstake(amount: Amount, fee: Amount, nonce: u64, timestamp: u64, signer: &dyn KeySigner) -> Self {
        let me = signer.address();
        Self::signed(TxKind::Unstake, me, amount, fee, nonce, timestamp, signer)
    }

    pub fn unjail(fee: Amount, nonce: u64, timestamp: u64, signer: &dyn KeySigner) -> Self {
        let me = signer.address();
        Self::signed(TxKind::Unjail, me, 0, fee, nonce, timestamp, signer)
    }

    /// Canonical bytes covered by the signature.
    ///
    /// Fixed-width little-endian fields, then the length-prefixed public key.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 20 + 20 + 16 + 16 + 8 + 8 + 4 + self.public_key.len());
        out.push(self.kind.tag());
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(self.recipient.as_bytes());
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.extend_from_slice(&self.fee.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&(self.public_key.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.public_key);
        out
    }

    pub fn compute_hash(&self) -> Hash {
        sha3_512_concat(&[&self.signing_bytes(), &self.signature])
    }

    /// Encoded size used for fee-per-byte ranking and block byte limits.
    pub fn size_bytes(&self) -> usize {
        // signing payload + signature + hash
        self.signing_bytes().len() + self.signature.len() + 64
    }

    /// Balance leaving the sender's spendable account.
    pub fn total_debit(&self) -> Option<Amount> {
        match self.kind {
            TxKind::Transfer | TxKind::Stake => self.amount.checked_add(self.fee),
            TxKind::Unstake | TxKind::Unjail => Some(self.fee),
        }
    }

    /// Compare fee-per-byte without dividing: `fee_a * size_b` vs `fee_b * size_a`.
    pub fn cmp_fee_rate(&self, other: &Transaction) -> Ordering {
        cmp_fee_rate(self.fee, self.size_bytes(), other.fee, other.size_bytes())
    }

    /// Checks that need no ledger: shape, hash, sender/key binding.
    pub fn validate_structure(&self) -> Result<(), ValidationError> {
        let id = self.hash.short();
        let malformed = |reason: &str| ValidationError::MalformedTransaction(format!("{}: {}", id, reason));

        if self.public_key.len() != ED25519_PUBKEY_LEN {
            return Err(malformed("public key must be 32 bytes"));
        }
        if self.signature.len() != ED25519_SIG_LEN {
            return Err(malformed("signature must be 64 bytes"));
        }
        if address_from_pubkey_bytes(&self.public_key) != self.sender {
            return Err(malformed("sender does not match public key"));
        }
        if self.compute_hash() != self.hash {
            return Err(malformed("hash does not match contents"));
        }
        if self.nonce == 0 {
            return Err(malformed("nonce starts at 1"));
        }
        if self.total_debit().is_none() {
            return Err(malformed("amount + fee overflows"));
        }
        match self.kind {
            TxKind::Transfer => {
                if self.amount == 0 {
                    return Err(malformed("transfer amount must be > 0"));
                }
            }
            TxKind::Stake | TxKind::Unstake => {
                if self.amount == 0 {
                    return Err(malformed("stake amount must be > 0"));
                }
                if self.recipient != self.sender {
                    return Err(malformed("stake recipient must be the sender"));
                }
            }
            TxKind::Unjail => {
                if self.amount != 0 || self.recipient != self.sender {
                    return Err(malformed("unjail carries no amount and targets the sender"));
                }
            }
        }
        Ok(())
    }

    pub fn verify_signature(&self, verifier: &dyn SignatureVerifier) -> bool {
        verifier.verify(&self.public_key, &self.signing_bytes(), &self.signature)
    }

    /// Structure + signature.
    pub fn validate(&self, verifier: &dyn SignatureVerifier) -> Result<(), ValidationError> {
        self.validate_structure()?;
        if !self.verify_signature(verifier) {
            return Err(ValidationError::BadTransactionSignature(self.hash.short()));
        }
        Ok(())
    }
}

/// `fee_a / size_a` vs `fee_b / size_b` by cross multiplication.
pub fn cmp_fee_rate(fee_a: Amount, size_a: usize, fee_b: Amount, size_b: usize) -> Ordering {
    let lhs = fee_a.saturating_mul(size_b as u128);
    let rhs = fee_b.saturating_mul(size_a as u128);
    lhs.cmp(&rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519Signer, Ed25519Verifier};

    #[test]
    fn signed_transfer_validates() {
        let alice = Ed25519Signer::generate();
        let bob = Ed25519Signer::generate();
        let tx = Transaction::transfer(bob.address(), 500, 10, 1, 1_000, &alice);
        assert_eq!(tx.sender, alice.address());
        tx.validate(&Ed25519Verifier).unwrap();
    }

    #[test]
    fn tampered_amount_breaks_hash() {
        let alice = Ed25519Signer::generate();
        let mut tx = Transaction::transfer(Address::from_bytes([9; 20]), 500, 10, 1, 1_000, &alice);
        tx.amount = 5_000;
        let err = tx.validate(&Ed25519Verifier).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedTransaction(_)));
    }

    #[test]
    fn resigned_by_other_key_fails_signature() {
        let alice = Ed25519Signer::generate();
        let mallory = Ed25519Signer::generate();
        let mut tx = Transaction::transfer(Address::from_bytes([9; 20]), 500, 10, 1, 1_000, &alice);
        tx.signature = mallory.sign(&tx.signing_bytes());
        tx.hash = tx.compute_hash();
        let err = tx.validate(&Ed25519Verifier).unwrap_err();
        assert!(matches!(err, ValidationError::BadTransactionSignature(_)));
    }

    #[test]
    fn unjail_must_not_carry_amount() {
        let v = Ed25519Signer::generate();
        let mut tx = Transaction::unjail(10, 1, 1_000, &v);
        tx.validate_structure().unwrap();
        tx.amount = 1;
        tx.signature = v.sign(&tx.signing_bytes());
        tx.hash = tx.compute_hash();
        assert!(tx.validate_structure().is_err());
    }

    #[test]
    fn hash_is_pure_function_of_contents() {
        let alice = Ed25519Signer::generate();
        let a = Transaction::transfer(Address::from_bytes([9; 20]), 1, 10, 1, 7, &alice);
        let b = a.clone();
        assert_eq!(a.compute_hash(), b.compute_hash());
        assert_eq!(a.hash, a.compute_hash());
    }

    #[test]
    fn fee_rate_uses_cross_multiplication() {
        assert_eq!(cmp_fee_rate(10, 100, 20, 200), Ordering::Equal);
        assert_eq!(cmp_fee_rate(11, 100, 20, 200), Ordering::Greater);
        assert_eq!(cmp_fee_rate(1, 300, 1, 200), Ordering::Less);
    }
}
