//! Transaction construction and signing for Bitcoin-family UTXO chains.
//!
//! Covers address classification for legacy, nested SegWit, native SegWit
//! and Taproot outputs, fee-aware building with sigop-adjusted sizing,
//! PSBT signing and finalization, and two-phase commit/reveal for data
//! carried in tapscript leaves.

pub mod address;
pub mod commit_reveal;
pub mod crypto;
pub mod error;
pub mod network;
pub mod psbt;
pub mod signer;
pub mod taproot;
pub mod transaction;
pub mod utxo;
pub mod vsize;
