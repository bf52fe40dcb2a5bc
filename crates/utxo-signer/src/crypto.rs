//! Hashing and curve-context adapter.
//!
//! Everything here is a thin wrapper over `sha2`, `ripemd` and the
//! `secp256k1` re-export of the `bitcoin` crate; the engine never implements
//! curve arithmetic itself.

use bitcoin::secp256k1::{All, Secp256k1};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Single SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// RIPEMD-160(SHA-256(data)), the hash behind P2PKH and P2WPKH programs.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// BIP-340 tagged hash: SHA256(SHA256(tag) || SHA256(tag) || msg).
pub fn tagged_hash(tag: &str, msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// Signing + verification context. Creation is cheap enough to do per call,
/// which keeps every build free of shared state.
pub fn secp() -> Secp256k1<All> {
    Secp256k1::new()
}
