//! PSBT signing engine.
//!
//! The container itself is `bitcoin::psbt::Psbt`, which keeps unknown and
//! proprietary entries intact across parse and serialize. This module adds
//! the signing, finalizing and extraction steps on top of it, reusing the
//! per-input signer on a scratch copy of the unsigned transaction.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::psbt::{Input, Psbt};
use bitcoin::script::{Builder, Instruction, PushBytesBuf, ScriptBuf};
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::sighash::{EcdsaSighashType, TapSighashType};
use bitcoin::taproot::{self, TapLeafHash};
use bitcoin::{Amount, Transaction, TxOut, Witness};
use tracing::{debug, info, warn};

use crate::address::{p2wpkh_script, script_for_key, AddressType};
use crate::error::{Result, SignerError};
use crate::signer::{
    sign_input, DeferredSighash, InputSpend, SigningContext, Signer, TapLeafSpend, TaprootSpend,
};
use crate::taproot::tweak_public_key;

pub fn parse_psbt(bytes: &[u8]) -> Result<Psbt> {
    Psbt::deserialize(bytes).map_err(|e| SignerError::MalformedPsbt(e.to_string()))
}

pub fn parse_psbt_base64(encoded: &str) -> Result<Psbt> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| SignerError::MalformedPsbt(format!("invalid base64: {e}")))?;
    parse_psbt(&bytes)
}

pub fn serialize_psbt(psbt: &Psbt) -> Vec<u8> {
    psbt.serialize()
}

pub fn serialize_psbt_base64(psbt: &Psbt) -> String {
    BASE64.encode(psbt.serialize())
}

/// Per-input signing request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToSignInput {
    pub index: usize,
    /// Overrides the call-wide allowed sighash list for this input.
    pub sighash_types: Option<Vec<u32>>,
    /// Sign taproot key-path inputs with the untweaked key.
    pub disable_tweak_signer: bool,
}

impl ToSignInput {
    pub fn new(index: usize) -> Self {
        ToSignInput {
            index,
            ..Default::default()
        }
    }
}

/// Outcome of [`sign_inputs`]. Failures are per input and do not stop the
/// other inputs from being signed.
#[derive(Debug, Default)]
pub struct SignReport {
    pub signed: Vec<usize>,
    pub failed: Vec<(usize, SignerError)>,
    /// Sighashes recorded when signing with [`Signer::DeferredHash`].
    pub deferred: Vec<DeferredSighash>,
}

#[derive(Debug, Default)]
pub struct FinalizeReport {
    pub finalized: Vec<usize>,
    pub failed: Vec<(usize, SignerError)>,
}

impl FinalizeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn input_error(input_index: usize, reason: impl Into<String>) -> SignerError {
    SignerError::Psbt {
        input_index,
        reason: reason.into(),
    }
}

/// The output spent by input `index`, from the witness UTXO or the full
/// previous transaction.
pub fn input_prevout(psbt: &Psbt, index: usize) -> Result<TxOut> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or_else(|| SignerError::InvalidInput(format!("psbt has no input {index}")))?;
    if let Some(utxo) = &input.witness_utxo {
        return Ok(utxo.clone());
    }
    let prev_tx = input
        .non_witness_utxo
        .as_ref()
        .ok_or_else(|| input_error(index, "missing witness and non-witness utxo"))?;
    let outpoint = psbt.unsigned_tx.input[index].previous_output;
    if prev_tx.compute_txid() != outpoint.txid {
        return Err(input_error(index, "non-witness utxo does not match the outpoint"));
    }
    prev_tx
        .output
        .get(outpoint.vout as usize)
        .cloned()
        .ok_or_else(|| input_error(index, "non-witness utxo has no such output"))
}

fn all_prevouts(psbt: &Psbt) -> Result<Vec<TxOut>> {
    (0..psbt.inputs.len())
        .map(|index| input_prevout(psbt, index))
        .collect()
}

/// Whether an input is spent under taproot rules.
pub fn is_taproot_input(input: &Input, prevout: Option<&TxOut>) -> bool {
    input.tap_internal_key.is_some()
        || input.tap_merkle_root.is_some()
        || !input.tap_scripts.is_empty()
        || input.tap_key_sig.is_some()
        || !input.tap_script_sigs.is_empty()
        || prevout.is_some_and(|p| p.script_pubkey.is_p2tr())
}

pub fn is_finalized(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

fn script_has_x_only_key(script: &ScriptBuf, key: &XOnlyPublicKey) -> bool {
    let key = key.serialize();
    script.instructions().any(|ins| {
        matches!(ins, Ok(Instruction::PushBytes(bytes)) if bytes.as_bytes() == key.as_slice())
    })
}

/// Sign the selected inputs of `psbt` with `signer`.
///
/// With `to_sign` unset every input the key controls is signed and inputs
/// it does not control are skipped. With `to_sign` set, each listed input
/// must be signable; failures are collected in the report. An empty
/// `allowed_sighash_types` allows only SIGHASH_ALL for ECDSA inputs and
/// SIGHASH_DEFAULT for taproot inputs.
///
/// Errors only when an index is out of range or no input was signed.
pub fn sign_inputs(
    psbt: &mut Psbt,
    signer: &Signer,
    allowed_sighash_types: &[u32],
    to_sign: Option<&[ToSignInput]>,
) -> Result<SignReport> {
    let explicit = to_sign.is_some();
    let requests: Vec<ToSignInput> = match to_sign {
        Some(list) => list.to_vec(),
        None => (0..psbt.inputs.len()).map(ToSignInput::new).collect(),
    };
    for request in &requests {
        if request.index >= psbt.inputs.len() {
            return Err(SignerError::InvalidInput(format!(
                "psbt has no input {} ({} inputs)",
                request.index,
                psbt.inputs.len()
            )));
        }
    }

    let mut report = SignReport::default();
    let mut ctx = SigningContext::randomized();
    for request in &requests {
        let allowed = request
            .sighash_types
            .as_deref()
            .unwrap_or(allowed_sighash_types);
        match sign_psbt_input(psbt, request, signer, allowed, &mut ctx) {
            Ok(true) => report.signed.push(request.index),
            Ok(false) if explicit => report.failed.push((
                request.index,
                input_error(request.index, "signing key does not control this input"),
            )),
            Ok(false) => debug!(index = request.index, "input not controlled by key, skipped"),
            Err(e) if explicit => report.failed.push((request.index, e)),
            Err(e) => debug!(index = request.index, error = %e, "input skipped"),
        }
    }
    report.deferred = ctx.deferred;

    if report.signed.is_empty() {
        return Err(match report.failed.into_iter().next() {
            Some((_, e)) => e,
            None => SignerError::InvalidInput("no input is controlled by the signing key".into()),
        });
    }
    info!(
        signed = report.signed.len(),
        failed = report.failed.len(),
        "signed psbt inputs"
    );
    Ok(report)
}

/// `Ok(false)` means the key does not control this input.
fn sign_psbt_input(
    psbt: &mut Psbt,
    request: &ToSignInput,
    signer: &Signer,
    allowed: &[u32],
    ctx: &mut SigningContext,
) -> Result<bool> {
    let index = request.index;
    if is_finalized(&psbt.inputs[index]) {
        return Err(input_error(index, "input is already finalized"));
    }
    let prevout = input_prevout(psbt, index)?;
    if is_taproot_input(&psbt.inputs[index], Some(&prevout)) {
        sign_taproot(psbt, request, signer, allowed, ctx)
    } else {
        sign_ecdsa(psbt, index, &prevout, signer, allowed, ctx)
    }
}

fn check_sighash(index: usize, sighash: u32, allowed: &[u32], default: u32) -> Result<()> {
    let ok = if allowed.is_empty() {
        sighash == default
    } else {
        allowed.contains(&sighash)
    };
    if ok {
        Ok(())
    } else {
        Err(input_error(index, format!("sighash type {sighash:#x} not allowed")))
    }
}

fn sign_ecdsa(
    psbt: &mut Psbt,
    index: usize,
    prevout: &TxOut,
    signer: &Signer,
    allowed: &[u32],
    ctx: &mut SigningContext,
) -> Result<bool> {
    let public_key = signer.public_key();
    let script = &prevout.script_pubkey;
    let address_type = if script.is_p2pkh() {
        AddressType::Legacy
    } else if script.is_p2wpkh() {
        AddressType::SegwitNative
    } else if script.is_p2sh() {
        AddressType::SegwitNested
    } else {
        return Err(SignerError::UnknownAddressType(format!(
            "input {index} spends an unsupported script"
        )));
    };
    if &script_for_key(&public_key, address_type)? != script {
        return Ok(false);
    }

    let sighash = psbt.inputs[index]
        .sighash_type
        .map(|t| t.to_u32())
        .unwrap_or(EcdsaSighashType::All.to_u32());
    check_sighash(index, sighash, allowed, EcdsaSighashType::All.to_u32())?;

    let prevouts = scratch_prevouts(psbt, index, prevout);
    let mut scratch = psbt.unsigned_tx.clone();
    let spend = InputSpend {
        sighash_type: Some(sighash),
        taproot: TaprootSpend::default(),
    };
    sign_input(&mut scratch, index, address_type, signer, &prevouts, &spend, ctx)?;

    let input = &mut psbt.inputs[index];
    if address_type == AddressType::SegwitNested && input.redeem_script.is_none() {
        input.redeem_script = Some(p2wpkh_script(&public_key));
    }
    if !signer.is_local() {
        return Ok(true);
    }
    let raw = match address_type {
        AddressType::Legacy => first_push(&scratch.input[index].script_sig),
        _ => scratch.input[index].witness.nth(0).map(<[u8]>::to_vec),
    }
    .ok_or_else(|| input_error(index, "signer produced no signature"))?;
    let signature = ecdsa::Signature::from_slice(&raw).map_err(|e| input_error(index, e.to_string()))?;
    input
        .partial_sigs
        .insert(bitcoin::PublicKey::new(public_key), signature);
    Ok(true)
}

/// Prevouts handed to the signer. Taproot sighashes need every input's
/// prevout; the ECDSA branches only read `index`, so unknown entries are
/// filled with a dummy.
fn scratch_prevouts(psbt: &Psbt, index: usize, prevout: &TxOut) -> Vec<TxOut> {
    let filler = TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new(),
    };
    let mut prevouts = vec![filler; psbt.inputs.len()];
    prevouts[index] = prevout.clone();
    prevouts
}

fn first_push(script: &ScriptBuf) -> Option<Vec<u8>> {
    match script.instructions().next()? {
        Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
        _ => None,
    }
}

fn sign_taproot(
    psbt: &mut Psbt,
    request: &ToSignInput,
    signer: &Signer,
    allowed: &[u32],
    ctx: &mut SigningContext,
) -> Result<bool> {
    let index = request.index;
    let (x_only, _) = signer.public_key().x_only_public_key();
    let prevouts = all_prevouts(psbt)?;
    let input = &psbt.inputs[index];

    let sighash = input
        .sighash_type
        .map(|t| t.to_u32())
        .unwrap_or(TapSighashType::Default as u32);
    check_sighash(index, sighash, allowed, TapSighashType::Default as u32)?;

    if !input.tap_scripts.is_empty() {
        let leaves: Vec<TapLeafSpend> = input
            .tap_scripts
            .iter()
            .filter(|(_, (script, _))| script_has_x_only_key(script, &x_only))
            .map(|(control_block, (script, _))| TapLeafSpend {
                leaf_script: script.clone(),
                control_block: control_block.clone(),
            })
            .collect();
        if leaves.is_empty() {
            return Ok(false);
        }

        for leaf in leaves {
            let leaf_hash: TapLeafHash = leaf.leaf_hash();
            let spend = InputSpend {
                sighash_type: Some(sighash),
                taproot: TaprootSpend::ScriptPath(leaf),
            };
            let mut scratch = psbt.unsigned_tx.clone();
            sign_input(
                &mut scratch,
                index,
                AddressType::SegwitTaproot,
                signer,
                &prevouts,
                &spend,
                ctx,
            )?;
            if let Some(signature) = schnorr_from_witness(&scratch, index, signer)? {
                psbt.inputs[index]
                    .tap_script_sigs
                    .insert((x_only, leaf_hash), signature);
            }
        }
        return Ok(true);
    }

    // Key path. The output key must be ours, tweaked unless opted out.
    let merkle_root = input.tap_merkle_root;
    if let Some(internal) = input.tap_internal_key {
        if internal != x_only {
            return Ok(false);
        }
    }
    let expected_output = if request.disable_tweak_signer {
        x_only
    } else {
        let root = merkle_root.map(|r| r.to_byte_array());
        tweak_public_key(&x_only, root.as_ref())?.0
    };
    let script = &prevouts[index].script_pubkey;
    if !script.is_p2tr() || script.as_bytes()[2..] != expected_output.serialize() {
        return Ok(false);
    }

    let spend = InputSpend {
        sighash_type: Some(sighash),
        taproot: if request.disable_tweak_signer {
            TaprootSpend::UntweakedKeyPath
        } else {
            TaprootSpend::KeyPath { merkle_root }
        },
    };
    let mut scratch = psbt.unsigned_tx.clone();
    sign_input(
        &mut scratch,
        index,
        AddressType::SegwitTaproot,
        signer,
        &prevouts,
        &spend,
        ctx,
    )?;
    if let Some(signature) = schnorr_from_witness(&scratch, index, signer)? {
        let input = &mut psbt.inputs[index];
        input.tap_key_sig = Some(signature);
        if input.tap_internal_key.is_none() && !request.disable_tweak_signer {
            input.tap_internal_key = Some(x_only);
        }
    }
    Ok(true)
}

fn schnorr_from_witness(
    tx: &Transaction,
    index: usize,
    signer: &Signer,
) -> Result<Option<taproot::Signature>> {
    if !signer.is_local() {
        return Ok(None);
    }
    let raw = tx.input[index]
        .witness
        .nth(0)
        .ok_or_else(|| input_error(index, "signer produced no signature"))?;
    taproot::Signature::from_slice(raw)
        .map(Some)
        .map_err(|e| input_error(index, e.to_string()))
}

fn push_bytes(index: usize, bytes: &[u8]) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec()).map_err(|_| input_error(index, "push too large"))
}

/// Turn the collected signatures of input `index` into its final scriptSig
/// and witness, then clear the signing fields.
pub fn finalize_input(psbt: &mut Psbt, index: usize) -> Result<()> {
    let prevout = input_prevout(psbt, index)?;
    let input = &mut psbt.inputs[index];
    if is_finalized(input) {
        return Ok(());
    }

    if is_taproot_input(input, Some(&prevout)) {
        let witness = if let Some(signature) = input.tap_key_sig {
            Witness::from_slice(&[signature.to_vec()])
        } else {
            let ((_, leaf_hash), signature) = input
                .tap_script_sigs
                .iter()
                .next()
                .ok_or_else(|| input_error(index, "no taproot signature to finalize"))?;
            let (control_block, (script, _)) = input
                .tap_scripts
                .iter()
                .find(|(cb, (script, _))| {
                    TapLeafHash::from_script(script, cb.leaf_version) == *leaf_hash
                })
                .ok_or_else(|| input_error(index, "signed leaf missing from tap scripts"))?;
            Witness::from_slice(&[
                signature.to_vec(),
                script.to_bytes(),
                control_block.serialize(),
            ])
        };
        input.final_script_witness = Some(witness);
    } else {
        let (public_key, signature) = input
            .partial_sigs
            .iter()
            .next()
            .map(|(pk, sig)| (*pk, *sig))
            .ok_or_else(|| input_error(index, "no signature to finalize"))?;
        let sig_bytes = signature.to_vec();
        let key_bytes = public_key.to_bytes();

        let script = &prevout.script_pubkey;
        if script.is_p2pkh() {
            input.final_script_sig = Some(
                Builder::new()
                    .push_slice(&push_bytes(index, &sig_bytes)?)
                    .push_slice(&push_bytes(index, &key_bytes)?)
                    .into_script(),
            );
        } else if script.is_p2wpkh() || script.is_p2sh() {
            if script.is_p2sh() {
                let redeem = input
                    .redeem_script
                    .clone()
                    .unwrap_or_else(|| p2wpkh_script(&public_key.inner));
                input.final_script_sig = Some(
                    Builder::new()
                        .push_slice(&push_bytes(index, redeem.as_bytes())?)
                        .into_script(),
                );
            }
            input.final_script_witness = Some(Witness::from_slice(&[sig_bytes, key_bytes]));
        } else {
            return Err(SignerError::UnknownAddressType(format!(
                "input {index} spends an unsupported script"
            )));
        }
    }

    clear_signing_fields(input);
    Ok(())
}

fn clear_signing_fields(input: &mut Input) {
    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivation.clear();
    input.tap_key_sig = None;
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_key_origins.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
}

/// Finalize every input independently; one failure does not stop the rest.
pub fn finalize_all_inputs(psbt: &mut Psbt) -> FinalizeReport {
    let mut report = FinalizeReport::default();
    for index in 0..psbt.inputs.len() {
        match finalize_input(psbt, index) {
            Ok(()) => report.finalized.push(index),
            Err(e) => {
                debug!(index, error = %e, "input not finalized");
                report.failed.push((index, e));
            }
        }
    }
    report
}

/// Assemble the network transaction.
///
/// Inputs that are not finalized are left with an empty scriptSig and
/// witness so a later signer can complete them.
pub fn extract_transaction(psbt: &Psbt) -> Transaction {
    let mut tx = psbt.unsigned_tx.clone();
    let mut missing = Vec::new();
    for (index, (txin, input)) in tx.input.iter_mut().zip(&psbt.inputs).enumerate() {
        if !is_finalized(input) {
            missing.push(index);
        }
        txin.script_sig = input.final_script_sig.clone().unwrap_or_default();
        txin.witness = input.final_script_witness.clone().unwrap_or_default();
    }
    if !missing.is_empty() {
        warn!(?missing, "extracting partially finalized psbt");
    }
    tx
}

/// The key that would satisfy a key-path input, for callers that want to
/// match inputs to keys before signing.
pub fn taproot_output_key(input: &Input) -> Option<XOnlyPublicKey> {
    let internal = input.tap_internal_key?;
    let root = input.tap_merkle_root.map(|r| r.to_byte_array());
    tweak_public_key(&internal, root.as_ref()).ok().map(|(key, _)| key)
}
