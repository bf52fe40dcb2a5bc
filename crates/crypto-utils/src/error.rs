use thiserror::Error;

/// Errors raised while drawing randomness.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("random source unavailable: {0}")]
    RandomUnavailable(String),
}
