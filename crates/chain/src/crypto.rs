//! crypto helpers for rpos-chain: hashing + signing boundary
//!
//! The core only ever *verifies* signatures through [`SignatureVerifier`].
//! Producing signatures is delegated to a [`KeySigner`] handed in by the
//! caller (node binary, wallet, tests).
use anyhow::{anyhow, Result};
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use hex::encode as hex_encode;
use rand_core::OsRng;
use sha3::{Digest, Sha3_512};

use crate::types::{Address, Hash};

/// compute sha3-512 hex string of bytes
pub fn sha3_512_hex(data: &[u8]) -> String {
    hex_encode(sha3_512_bytes(data))
}

/// compute sha3-512 raw bytes (64 bytes)
pub fn sha3_512_bytes(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha3_512::new();
    hasher.update(data);
    let sum = hasher.finalize();
    sum.into()
}

/// compute sha3-512 and return as Hash type
pub fn sha3_512(data: &[u8]) -> Hash {
    Hash::from_bytes(sha3_512_bytes(data))
}

/// Hash of several byte slices fed in order.
pub fn sha3_512_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha3_512::new();
    for p in parts {
        hasher.update(p);
    }
    Hash::from_bytes(hasher.finalize().into())
}

/// Derive Address from raw public key bytes: addr = SHA3-512(pubkey)[:20]
pub fn address_from_pubkey_bytes(pubkey_bytes: &[u8]) -> Address {
    let hash = sha3_512_bytes(pubkey_bytes);
    let mut arr = [0u8; 20];
    arr.copy_from_slice(&hash[0..20]);
    Address::from_bytes(arr)
}

// ════════════════════════════════════════════════════════════════════════════
// SIGNING BOUNDARY
// ════════════════════════════════════════════════════════════════════════════

/// Verifies `signature` over `payload` for `public_key`.
///
/// Implementations must be pure: no I/O, no key storage. Any malformed input
/// is simply `false`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool;
}

/// Default verifier backed by ed25519-dalek.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool {
        ed25519_verify(public_key, payload, signature)
    }
}

/// Signs blocks and transactions. Supplied by whoever holds the key.
pub trait KeySigner: Send + Sync {
    fn public_key(&self) -> Vec<u8>;
    fn sign(&self, payload: &[u8]) -> Vec<u8>;

    fn address(&self) -> Address {
        address_from_pubkey_bytes(&self.public_key())
    }
}

pub fn ed25519_verify(pubkey_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> bool {
    let pk = match PublicKey::from_bytes(pubkey_bytes) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let sig = match Signature::from_bytes(sig_bytes) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    pk.verify(msg, &sig).is_ok()
}

/// Generate a fresh keypair: (public key bytes, secret key bytes).
pub fn generate_ed25519_keypair_bytes() -> (Vec<u8>, Vec<u8>) {
    let mut csprng = OsRng {};
    let kp = Keypair::generate(&mut csprng);
    (kp.public.to_bytes().to_vec(), kp.secret.to_bytes().to_vec())
}

/// Sign message with 32-byte secret key bytes.
pub fn sign_with_secret_key(secret: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let secret_key =
        SecretKey::from_bytes(secret).map_err(|e| anyhow!("invalid secret key: {}", e))?;
    let public_key: PublicKey = (&secret_key).into();
    let kp = Keypair {
        secret: secret_key,
        public: public_key,
    };
    Ok(kp.sign(msg).to_bytes().to_vec())
}

/// In-process ed25519 signer. Used by the node binary and by tests.
#[derive(Clone)]
pub struct Ed25519Signer {
    secret: [u8; 32],
    public: [u8; 32],
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        let mut csprng = OsRng {};
        let kp = Keypair::generate(&mut csprng);
        Self {
            secret: kp.secret.to_bytes(),
            public: kp.public.to_bytes(),
        }
    }

    pub fn from_secret_bytes(b: &[u8]) -> Result<Self> {
        let secret_key = SecretKey::from_bytes(b).map_err(|e| anyhow!("invalid secret key: {}", e))?;
        let public_key: PublicKey = (&secret_key).into();
        Ok(Self {
            secret: secret_key.to_bytes(),
            public: public_key.to_bytes(),
        })
    }

    pub fn from_secret_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim().trim_start_matches("0x"))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn secret_hex(&self) -> String {
        hex_encode(self.secret)
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("address", &self.address())
            .finish()
    }
}

impl KeySigner for Ed25519Signer {
    fn public_key(&self) -> Vec<u8> {
        self.public.to_vec()
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        // secret was validated at construction
        match sign_with_secret_key(&self.secret, payload) {
            Ok(sig) => sig,
            Err(_) => Vec::new(),
        }
    }
}
