//! # crypto-utils
//!
//! Randomness sources shared by the signing engine: BIP-340 auxiliary
//! randomness and OS-backed nonces.

pub mod error;
pub mod random;

pub use error::CryptoError;
pub use random::AuxRandPolicy;
