use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use hex::{encode as hex_encode, decode as hex_decode};
use anyhow::Result;

/// Address is 20 bytes (first 20 bytes of SHA3-512(pubkey))
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(b: [u8; 20]) -> Self { Address(b) }
    pub fn as_bytes(&self) -> &[u8; 20] { &self.0 }
    pub fn to_hex(&self) -> String { hex_encode(self.0) }
    pub fn from_hex(s: &str) -> Result<Self, anyhow::Error> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex_decode(s)?;
        if bytes.len() != 20 { anyhow::bail!("invalid address length: {}", bytes.len()); }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Address(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.to_hex()).finish()
    }
}
impl FromStr for Address {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_hex(s)
    }
}

/* --- serde serialize/deserialize for Address as hex string --- */
impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where S: Serializer {
        serializer.serialize_str(&self.to_hex())
    }
}
impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Address, D::Error>
    where D: Deserializer<'de> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash type: sha3-512 digest wrapper (64 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 64]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 64]);

    pub fn from_bytes(b: [u8; 64]) -> Self { Hash(b) }
    pub fn as_bytes(&self) -> &[u8; 64] { &self.0 }
    pub fn to_hex(&self) -> String { hex_encode(self.0) }

    /// First 8 bytes in hex, for log lines.
    pub fn short(&self) -> String { hex_encode(&self.0[..8]) }

    pub fn from_slice(b: &[u8]) -> Option<Self> {
        if b.len() != 64 {
            return None;
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(b);
        Some(Hash(arr))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.short()).finish()
    }
}

impl FromStr for Hash {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let v = hex_decode(s)?;
        Hash::from_slice(&v).ok_or_else(|| anyhow::anyhow!("invalid sha3-512 length: {}", v.len()))
    }
}

/* serde impls for Hash as hex string */
impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where S: Serializer {
        serializer.serialize_str(&self.to_hex())
    }
}
impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Hash, D::Error>
    where D: Deserializer<'de> {
        let s = String::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Token amount in smallest units (8 decimals).
pub type Amount = u128;

/// exposed constants for tokenomics
pub const DECIMALS: u32 = 8;
pub const SCALE: u128 = 10u128.pow(DECIMALS);

/// Account credited with slashed stake.
pub const TREASURY_ADDRESS: Address = Address([0xEE; 20]);

/// Renders a base-unit amount as a decimal string ("10.5").
pub fn format_amount(amount: Amount) -> String {
    let whole = amount / SCALE;
    let frac = amount % SCALE;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:08}", frac);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[test]
    fn address_from_pubkey_deterministic() {
        let (pk, _sk) = crypto::generate_ed25519_keypair_bytes();
        let addr1 = crypto::address_from_pubkey_bytes(&pk);
        let addr2 = crypto::address_from_pubkey_bytes(&pk);
        assert_eq!(addr1, addr2);
        assert_eq!(addr1.to_hex().len(), 40);
    }

    #[test]
    fn hash_hex_roundtrip_through_serde() {
        let h = crypto::sha3_512(b"rpos");
        let json = serde_json::to_string(&h).unwrap();
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
        assert!(Hash::from_str("abcd").is_err());
    }

    #[test]
    fn format_amount_trims_fraction() {
        assert_eq!(format_amount(21 * SCALE), "21");
        assert_eq!(format_amount(21 * SCALE / 2), "10.5");
        assert_eq!(format_amount(21 * SCALE / 4), "5.25");
    }
}
