use thiserror::Error;

/// Errors raised while classifying, building, signing, or finalizing
/// Bitcoin-family transactions.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unknown address type: {0}")]
    UnknownAddressType(String),

    #[error("missing key material for input {input_index}")]
    MissingKeyMaterial { input_index: usize },

    #[error("invalid taproot tweak: scalar is not below the curve order")]
    InvalidTweak,

    #[error("insufficient funds: required {required}, available {available}, short by {shortfall}")]
    InsufficientFunds {
        required: u64,
        available: u64,
        shortfall: u64,
    },

    #[error("transaction {index} too large: weight {weight} exceeds {limit}")]
    TransactionTooLarge { index: usize, weight: u64, limit: u64 },

    #[error("malformed psbt: {0}")]
    MalformedPsbt(String),

    #[error("signature verification failed for input {input_index}")]
    SignatureVerificationFailed { input_index: usize },

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("sighash computation failed: {0}")]
    Sighash(String),

    #[error("psbt input {input_index}: {reason}")]
    Psbt { input_index: usize, reason: String },

    #[error(transparent)]
    Crypto(#[from] crypto_utils::CryptoError),
}

pub type Result<T> = std::result::Result<T, SignerError>;
