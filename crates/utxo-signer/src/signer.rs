//! Per-input signing for the four supported address families.
//!
//! [`sign_input`] computes the sighash for one input, signs it (or records it
//! for a remote signer) and writes the scriptSig and witness in place.
//! [`verify_input`] re-derives the same sighash from a finished transaction
//! and checks the signature that was written.

use std::collections::BTreeMap;

use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, Instruction, PushBytesBuf, Script, ScriptBuf};
use bitcoin::secp256k1::{Keypair, Message, PublicKey, SecretKey, XOnlyPublicKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{self, ControlBlock, TapLeafHash, TapNodeHash};
use bitcoin::{Transaction, TxOut, Witness};
use crypto_utils::AuxRandPolicy;

use crate::address::{p2wpkh_script, script_for_key, AddressType};
use crate::crypto::secp;
use crate::error::{Result, SignerError};
use crate::taproot::{tweak_private_key, tweak_public_key};

/// Well-known private key used to sign sizing passes when the real key is
/// not available. Never used for a transaction that leaves the engine.
pub const ESTIMATE_PRIVATE_KEY: [u8; 32] = [0x01; 32];

/// Length of a zero-filled ECDSA placeholder: the longest DER signature plus
/// the sighash byte.
pub const ECDSA_PLACEHOLDER_LEN: usize = 72;

/// Length of a Schnorr signature with SIGHASH_DEFAULT.
pub const SCHNORR_SIGNATURE_LEN: usize = 64;

/// The placeholder key as a secp256k1 secret.
pub fn estimate_secret_key() -> Result<SecretKey> {
    SecretKey::from_slice(&ESTIMATE_PRIVATE_KEY)
        .map_err(|e| SignerError::InvalidPrivateKey(format!("estimate key: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Ecdsa,
    Schnorr,
}

/// A sighash handed to an external signer instead of being signed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredSighash {
    pub input_index: usize,
    pub sighash: [u8; 32],
    pub algorithm: SignatureAlgorithm,
    pub sighash_type: u32,
}

/// Scratch state for one signing pass.
#[derive(Debug, Clone, Default)]
pub struct SigningContext {
    pub aux_rand: AuxRandPolicy,
    pub deferred: Vec<DeferredSighash>,
    pub algorithms: BTreeMap<usize, SignatureAlgorithm>,
}

impl SigningContext {
    /// Context for sizing passes: Schnorr signatures carry no aux randomness,
    /// so the same inputs always produce the same bytes.
    pub fn deterministic() -> Self {
        SigningContext {
            aux_rand: AuxRandPolicy::Deterministic,
            ..Default::default()
        }
    }

    /// Context for the final pass.
    pub fn randomized() -> Self {
        SigningContext {
            aux_rand: AuxRandPolicy::Random,
            ..Default::default()
        }
    }

    fn record(
        &mut self,
        signer: &Signer,
        input_index: usize,
        sighash: [u8; 32],
        algorithm: SignatureAlgorithm,
        sighash_type: u32,
    ) {
        self.algorithms.insert(input_index, algorithm);
        if matches!(signer, Signer::DeferredHash { .. }) {
            self.deferred.push(DeferredSighash {
                input_index,
                sighash,
                algorithm,
                sighash_type,
            });
        }
    }
}

/// Who produces the signatures for an input.
#[derive(Debug, Clone)]
pub enum Signer {
    /// Sign immediately with a key held in memory.
    LocalKey(SecretKey),
    /// Record the sighash and write a zero-filled signature of final length;
    /// the caller signs elsewhere and splices the result in.
    DeferredHash { public_key: PublicKey },
}

impl Signer {
    pub fn public_key(&self) -> PublicKey {
        match self {
            Signer::LocalKey(key) => PublicKey::from_secret_key(&secp(), key),
            Signer::DeferredHash { public_key } => *public_key,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Signer::LocalKey(_))
    }
}

/// A tapscript leaf being satisfied, with the control block proving it is
/// committed in the output key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapLeafSpend {
    pub leaf_script: ScriptBuf,
    pub control_block: ControlBlock,
}

impl TapLeafSpend {
    pub fn leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.leaf_script, self.control_block.leaf_version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaprootSpend {
    /// Key-path spend. `merkle_root` is the script tree the output key also
    /// commits to, if any.
    KeyPath { merkle_root: Option<TapNodeHash> },
    /// Key-path sighash signed with the raw internal key, for callers that
    /// apply their own tweak upstream.
    UntweakedKeyPath,
    ScriptPath(TapLeafSpend),
}

impl Default for TaprootSpend {
    fn default() -> Self {
        TaprootSpend::KeyPath { merkle_root: None }
    }
}

/// Per-input signing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputSpend {
    /// Sighash type override. Defaults to SIGHASH_ALL for ECDSA inputs and
    /// SIGHASH_DEFAULT for taproot inputs.
    pub sighash_type: Option<u32>,
    /// Ignored for non-taproot inputs.
    pub taproot: TaprootSpend,
}

fn sighash_error(e: impl std::fmt::Display) -> SignerError {
    SignerError::Sighash(e.to_string())
}

fn ecdsa_sighash_type(spend: &InputSpend) -> Result<EcdsaSighashType> {
    match spend.sighash_type {
        None => Ok(EcdsaSighashType::All),
        Some(raw) => EcdsaSighashType::from_standard(raw).map_err(sighash_error),
    }
}

fn tap_sighash_type(spend: &InputSpend) -> Result<TapSighashType> {
    match spend.sighash_type {
        None => Ok(TapSighashType::Default),
        Some(raw) => {
            let byte = u8::try_from(raw)
                .map_err(|_| SignerError::Sighash(format!("invalid taproot sighash {raw:#x}")))?;
            TapSighashType::from_consensus_u8(byte).map_err(sighash_error)
        }
    }
}

fn push(bytes: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|_| SignerError::InvalidInput("script push exceeds 4GB".into()))
}

/// Produce an ECDSA signature with its sighash byte, or the placeholder.
fn ecdsa_signature(
    signer: &Signer,
    sighash: [u8; 32],
    sighash_type: EcdsaSighashType,
) -> Vec<u8> {
    match signer {
        Signer::LocalKey(key) => {
            let msg = Message::from_digest(sighash);
            let signature = secp().sign_ecdsa(&msg, key);
            ecdsa::Signature {
                signature,
                sighash_type,
            }
            .to_vec()
        }
        Signer::DeferredHash { .. } => vec![0u8; ECDSA_PLACEHOLDER_LEN],
    }
}

/// Produce a BIP-340 signature with its optional sighash byte, or the
/// placeholder. `key` is the exact key that signs (already tweaked for key
/// path spends).
fn schnorr_signature(
    key: Option<&SecretKey>,
    sighash: [u8; 32],
    sighash_type: TapSighashType,
    aux_rand: AuxRandPolicy,
) -> Result<Vec<u8>> {
    let Some(key) = key else {
        let len = match sighash_type {
            TapSighashType::Default => SCHNORR_SIGNATURE_LEN,
            _ => SCHNORR_SIGNATURE_LEN + 1,
        };
        return Ok(vec![0u8; len]);
    };

    let secp = secp();
    let keypair = Keypair::from_secret_key(&secp, key);
    let msg = Message::from_digest(sighash);
    let signature = match aux_rand.draw()? {
        Some(aux) => secp.sign_schnorr_with_aux_rand(&msg, &keypair, &aux),
        None => secp.sign_schnorr_no_aux_rand(&msg, &keypair),
    };
    Ok(taproot::Signature {
        signature,
        sighash_type,
    }
    .to_vec())
}

/// Sign input `index` of `tx` and write its scriptSig/witness.
///
/// `prevouts` lists the outputs spent by every input of `tx`, in order.
/// Taproot sighashes commit to all of them; the other families only read
/// the entry at `index`.
pub fn sign_input(
    tx: &mut Transaction,
    index: usize,
    address_type: AddressType,
    signer: &Signer,
    prevouts: &[TxOut],
    spend: &InputSpend,
    ctx: &mut SigningContext,
) -> Result<()> {
    if index >= tx.input.len() {
        return Err(SignerError::InvalidInput(format!(
            "input {index} out of range ({} inputs)",
            tx.input.len()
        )));
    }
    let prevout = prevouts
        .get(index)
        .ok_or_else(|| SignerError::InvalidInput(format!("missing prevout for input {index}")))?;

    match address_type {
        AddressType::Legacy => sign_legacy(tx, index, signer, prevout, spend, ctx),
        AddressType::SegwitNative => sign_segwit_v0(tx, index, signer, prevout, spend, ctx, false),
        AddressType::SegwitNested => sign_segwit_v0(tx, index, signer, prevout, spend, ctx, true),
        AddressType::SegwitTaproot => match &spend.taproot {
            TaprootSpend::KeyPath { merkle_root } => {
                let root = merkle_root.map(|r| r.to_byte_array());
                sign_taproot_key_path(tx, index, signer, prevouts, Some(root), spend, ctx)
            }
            TaprootSpend::UntweakedKeyPath => {
                sign_taproot_key_path(tx, index, signer, prevouts, None, spend, ctx)
            }
            TaprootSpend::ScriptPath(leaf) => {
                sign_taproot_script_path(tx, index, signer, prevouts, leaf, spend, ctx)
            }
        },
    }
}

fn sign_legacy(
    tx: &mut Transaction,
    index: usize,
    signer: &Signer,
    prevout: &TxOut,
    spend: &InputSpend,
    ctx: &mut SigningContext,
) -> Result<()> {
    let sighash_type = ecdsa_sighash_type(spend)?;
    let sighash = SighashCache::new(&*tx)
        .legacy_signature_hash(index, &prevout.script_pubkey, sighash_type.to_u32())
        .map_err(sighash_error)?
        .to_byte_array();
    ctx.record(signer, index, sighash, SignatureAlgorithm::Ecdsa, sighash_type.to_u32());

    let signature = ecdsa_signature(signer, sighash, sighash_type);
    let public_key = signer.public_key();
    tx.input[index].script_sig = Builder::new()
        .push_slice(&push(&signature)?)
        .push_slice(&push(&public_key.serialize())?)
        .into_script();
    tx.input[index].witness = Witness::new();
    Ok(())
}

fn sign_segwit_v0(
    tx: &mut Transaction,
    index: usize,
    signer: &Signer,
    prevout: &TxOut,
    spend: &InputSpend,
    ctx: &mut SigningContext,
    nested: bool,
) -> Result<()> {
    if prevout.script_pubkey.is_p2wsh() {
        return Err(SignerError::InvalidInput(format!(
            "input {index} is P2WSH; only key-hash witness programs can be signed"
        )));
    }
    let sighash_type = ecdsa_sighash_type(spend)?;
    let public_key = signer.public_key();
    let program = p2wpkh_script(&public_key);

    let sighash = SighashCache::new(&*tx)
        .p2wpkh_signature_hash(index, &program, prevout.value, sighash_type)
        .map_err(sighash_error)?
        .to_byte_array();
    ctx.record(signer, index, sighash, SignatureAlgorithm::Ecdsa, sighash_type.to_u32());

    let signature = ecdsa_signature(signer, sighash, sighash_type);
    tx.input[index].witness = Witness::from_slice(&[signature, public_key.serialize().to_vec()]);
    tx.input[index].script_sig = if nested {
        Builder::new()
            .push_slice(&push(program.as_bytes())?)
            .into_script()
    } else {
        ScriptBuf::new()
    };
    Ok(())
}

/// `tweak` carries the Merkle root to tweak with; `None` signs untweaked.
fn sign_taproot_key_path(
    tx: &mut Transaction,
    index: usize,
    signer: &Signer,
    prevouts: &[TxOut],
    tweak: Option<Option<[u8; 32]>>,
    spend: &InputSpend,
    ctx: &mut SigningContext,
) -> Result<()> {
    let sighash_type = tap_sighash_type(spend)?;
    let sighash = SighashCache::new(&*tx)
        .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), sighash_type)
        .map_err(sighash_error)?
        .to_byte_array();
    ctx.record(signer, index, sighash, SignatureAlgorithm::Schnorr, sighash_type as u32);

    let signing_key = match (signer, tweak) {
        (Signer::LocalKey(key), Some(root)) => Some(tweak_private_key(key, root.as_ref())?),
        (Signer::LocalKey(key), None) => Some(*key),
        (Signer::DeferredHash { .. }, _) => None,
    };
    let signature = schnorr_signature(signing_key.as_ref(), sighash, sighash_type, ctx.aux_rand)?;

    tx.input[index].witness = Witness::from_slice(&[signature]);
    tx.input[index].script_sig = ScriptBuf::new();
    Ok(())
}

fn sign_taproot_script_path(
    tx: &mut Transaction,
    index: usize,
    signer: &Signer,
    prevouts: &[TxOut],
    leaf: &TapLeafSpend,
    spend: &InputSpend,
    ctx: &mut SigningContext,
) -> Result<()> {
    let sighash_type = tap_sighash_type(spend)?;
    let sighash = SighashCache::new(&*tx)
        .taproot_script_spend_signature_hash(
            index,
            &Prevouts::All(prevouts),
            leaf.leaf_hash(),
            sighash_type,
        )
        .map_err(sighash_error)?
        .to_byte_array();
    ctx.record(signer, index, sighash, SignatureAlgorithm::Schnorr, sighash_type as u32);

    // Script-path spends sign with the internal key as-is.
    let key = match signer {
        Signer::LocalKey(key) => Some(key),
        Signer::DeferredHash { .. } => None,
    };
    let signature = schnorr_signature(key, sighash, sighash_type, ctx.aux_rand)?;

    tx.input[index].witness = Witness::from_slice(&[
        signature,
        leaf.leaf_script.to_bytes(),
        leaf.control_block.serialize(),
    ]);
    tx.input[index].script_sig = ScriptBuf::new();
    Ok(())
}

/// Output key of a P2TR script.
fn taproot_program(script_pubkey: &Script) -> Option<XOnlyPublicKey> {
    if !script_pubkey.is_p2tr() {
        return None;
    }
    XOnlyPublicKey::from_slice(&script_pubkey.as_bytes()[2..]).ok()
}

/// Whether `script_pubkey` is locked to `public_key` for this spend.
fn owns_prevout(
    script_pubkey: &Script,
    address_type: AddressType,
    spend: &InputSpend,
    public_key: &PublicKey,
) -> Result<bool> {
    if address_type != AddressType::SegwitTaproot {
        return Ok(script_for_key(public_key, address_type)?.as_script() == script_pubkey);
    }
    let Some(program) = taproot_program(script_pubkey) else {
        return Ok(false);
    };
    let (internal, _) = public_key.x_only_public_key();
    Ok(match &spend.taproot {
        TaprootSpend::KeyPath { merkle_root } => {
            let root = merkle_root.map(|r| r.to_byte_array());
            tweak_public_key(&internal, root.as_ref())?.0 == program
        }
        TaprootSpend::UntweakedKeyPath => internal == program,
        TaprootSpend::ScriptPath(leaf) => {
            leaf.control_block
                .verify_taproot_commitment(&secp(), program, &leaf.leaf_script)
        }
    })
}

/// Check the signature already written for input `index` against
/// `public_key`.
///
/// For taproot key-path inputs `public_key` is the internal key; it is
/// tweaked with the spend's Merkle root before verifying. The key must also
/// control the prevout: its hash for legacy and v0 outputs, the tweaked key
/// (or the raw key for untweaked spends) for P2TR, and a control block that
/// commits the leaf to the output key for script-path spends.
pub fn verify_input(
    tx: &Transaction,
    index: usize,
    address_type: AddressType,
    prevouts: &[TxOut],
    spend: &InputSpend,
    public_key: &PublicKey,
) -> Result<()> {
    let failed = || SignerError::SignatureVerificationFailed { input_index: index };
    let input = tx.input.get(index).ok_or_else(failed)?;
    let prevout = prevouts.get(index).ok_or_else(failed)?;
    if !owns_prevout(&prevout.script_pubkey, address_type, spend, public_key)? {
        return Err(failed());
    }
    let secp = secp();
    let mut cache = SighashCache::new(tx);

    match address_type {
        AddressType::Legacy => {
            let pushes: Vec<Vec<u8>> = input
                .script_sig
                .instructions()
                .filter_map(|ins| match ins {
                    Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
                    _ => None,
                })
                .collect();
            let [sig, key] = pushes.as_slice() else {
                return Err(failed());
            };
            if key.as_slice() != public_key.serialize().as_slice() {
                return Err(failed());
            }
            let sig = ecdsa::Signature::from_slice(sig).map_err(|_| failed())?;
            let sighash = cache
                .legacy_signature_hash(index, &prevout.script_pubkey, sig.sighash_type.to_u32())
                .map_err(sighash_error)?;
            secp.verify_ecdsa(
                &Message::from_digest(sighash.to_byte_array()),
                &sig.signature,
                public_key,
            )
            .map_err(|_| failed())
        }
        AddressType::SegwitNative | AddressType::SegwitNested => {
            let (Some(sig), Some(key)) = (input.witness.nth(0), input.witness.nth(1)) else {
                return Err(failed());
            };
            if key != public_key.serialize().as_slice() {
                return Err(failed());
            }
            let sig = ecdsa::Signature::from_slice(sig).map_err(|_| failed())?;
            let sighash = cache
                .p2wpkh_signature_hash(
                    index,
                    &p2wpkh_script(public_key),
                    prevout.value,
                    sig.sighash_type,
                )
                .map_err(sighash_error)?;
            secp.verify_ecdsa(
                &Message::from_digest(sighash.to_byte_array()),
                &sig.signature,
                public_key,
            )
            .map_err(|_| failed())
        }
        AddressType::SegwitTaproot => {
            let sig = input.witness.nth(0).ok_or_else(failed)?;
            let sig = taproot::Signature::from_slice(sig).map_err(|_| failed())?;
            let (internal, _) = public_key.x_only_public_key();

            let (sighash, key): (_, XOnlyPublicKey) = match &spend.taproot {
                TaprootSpend::KeyPath { merkle_root } => {
                    let root = merkle_root.map(|r| r.to_byte_array());
                    let (output_key, _) = tweak_public_key(&internal, root.as_ref())?;
                    let sighash = cache
                        .taproot_key_spend_signature_hash(
                            index,
                            &Prevouts::All(prevouts),
                            sig.sighash_type,
                        )
                        .map_err(sighash_error)?;
                    (sighash, output_key)
                }
                TaprootSpend::UntweakedKeyPath => {
                    let sighash = cache
                        .taproot_key_spend_signature_hash(
                            index,
                            &Prevouts::All(prevouts),
                            sig.sighash_type,
                        )
                        .map_err(sighash_error)?;
                    (sighash, internal)
                }
                TaprootSpend::ScriptPath(leaf) => {
                    let sighash = cache
                        .taproot_script_spend_signature_hash(
                            index,
                            &Prevouts::All(prevouts),
                            leaf.leaf_hash(),
                            sig.sighash_type,
                        )
                        .map_err(sighash_error)?;
                    (sighash, internal)
                }
            };
            secp.verify_schnorr(
                &sig.signature,
                &Message::from_digest(sighash.to_byte_array()),
                &key,
            )
            .map_err(|_| failed())
        }
    }
}
