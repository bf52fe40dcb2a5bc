use rand::RngCore;
use rand_core::OsRng;

use crate::error::CryptoError;

/// Fills a fixed-size array from the OS random source.
pub fn try_random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CryptoError::RandomUnavailable(e.to_string()))?;
    Ok(buf)
}

/// How BIP-340 auxiliary randomness is chosen for a Schnorr signature.
///
/// Size estimation signs with [`AuxRandPolicy::Deterministic`] so repeated
/// passes produce byte-identical transactions; final signatures draw fresh
/// randomness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuxRandPolicy {
    Deterministic,
    #[default]
    Random,
}

impl AuxRandPolicy {
    /// The 32 aux bytes to mix into the nonce, or `None` for the
    /// no-aux-rand signing variant.
    pub fn draw(self) -> Result<Option<[u8; 32]>, CryptoError> {
        match self {
            AuxRandPolicy::Deterministic => Ok(None),
            AuxRandPolicy::Random => try_random_bytes::<32>().map(Some),
        }
    }
}
