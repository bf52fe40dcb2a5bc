use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::psbt::{Psbt, PsbtSighashType};
use bitcoin::script::{Builder, PushBytesBuf, ScriptBuf};
use bitcoin::secp256k1::SecretKey;
use bitcoin::taproot::TapNodeHash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::{p2wpkh_script, AddressType, ScriptSource};
use crate::error::{Result, SignerError};
use crate::network::NetworkParams;
use crate::signer::{
    estimate_secret_key, sign_input, verify_input, InputSpend, SigningContext, Signer,
    TapLeafSpend, TaprootSpend,
};
use crate::vsize::adjusted_vsize;

/// Outputs at or below this many satoshis are not worth creating.
pub const DEFAULT_DUST_THRESHOLD: u64 = 546;

/// Transaction-level settings that rarely change between builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    pub version: i32,
    pub lock_time: u32,
    /// nSequence for inputs that do not set their own.
    pub default_sequence: u32,
    /// Verify every locally produced signature before returning.
    pub verify_signatures: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            version: 2,
            lock_time: 0,
            default_sequence: Sequence::ENABLE_RBF_NO_LOCKTIME.0,
            verify_signatures: true,
        }
    }
}

/// An output being spent.
#[derive(Debug, Clone)]
pub struct UnsignedInput {
    pub txid: Txid,
    pub vout: u32,
    /// The script (or address) that locks the output.
    pub source: ScriptSource,
    pub amount: u64,
    pub private_key: Option<SecretKey>,
    pub sequence: Option<Sequence>,
    /// Full previous transaction; checked against `txid`, `vout` and
    /// `amount` when present.
    pub prev_tx: Option<Transaction>,
    /// Spend a tapscript leaf instead of the key path.
    pub tap_leaf: Option<TapLeafSpend>,
    /// Script tree committed by a key-path taproot output.
    pub tap_merkle_root: Option<TapNodeHash>,
    pub sighash_type: Option<u32>,
}

impl UnsignedInput {
    /// `txid` is the usual display-order hex string.
    pub fn new(txid: &str, vout: u32, source: ScriptSource, amount: u64) -> Result<Self> {
        let txid = Txid::from_str(txid)
            .map_err(|e| SignerError::InvalidInput(format!("invalid txid {txid:?}: {e}")))?;
        Ok(UnsignedInput {
            txid,
            vout,
            source,
            amount,
            private_key: None,
            sequence: None,
            prev_tx: None,
            tap_leaf: None,
            tap_merkle_root: None,
            sighash_type: None,
        })
    }

    pub fn with_private_key(mut self, key: SecretKey) -> Self {
        self.private_key = Some(key);
        self
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    fn spend(&self) -> InputSpend {
        let taproot = match &self.tap_leaf {
            Some(leaf) => TaprootSpend::ScriptPath(leaf.clone()),
            None => TaprootSpend::KeyPath {
                merkle_root: self.tap_merkle_root,
            },
        };
        InputSpend {
            sighash_type: self.sighash_type,
            taproot,
        }
    }

    fn check_prev_tx(&self, index: usize, script_pubkey: &ScriptBuf) -> Result<()> {
        let Some(prev_tx) = &self.prev_tx else {
            return Ok(());
        };
        let mismatch = |what: &str| {
            SignerError::InvalidInput(format!("input {index}: previous transaction {what}"))
        };
        if prev_tx.compute_txid() != self.txid {
            return Err(mismatch("has a different txid"));
        }
        let output = prev_tx
            .output
            .get(self.vout as usize)
            .ok_or_else(|| mismatch("has no such output"))?;
        if output.value.to_sat() != self.amount {
            return Err(mismatch("output value differs from the input amount"));
        }
        if &output.script_pubkey != script_pubkey {
            return Err(mismatch("output script differs from the input script"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedOutput {
    pub destination: ScriptSource,
    pub amount: u64,
}

impl UnsignedOutput {
    pub fn new(destination: ScriptSource, amount: u64) -> Self {
        UnsignedOutput {
            destination,
            amount,
        }
    }

    pub fn to_address(address: impl Into<String>, amount: u64) -> Self {
        Self::new(ScriptSource::address(address), amount)
    }
}

/// Data carried in a zero-value `OP_RETURN` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memo {
    pub data: Vec<u8>,
    /// Output index to insert at; appended after the payments when `None`
    /// or past the end.
    pub position: Option<usize>,
}

impl Memo {
    pub fn script(&self) -> Result<ScriptBuf> {
        let data = PushBytesBuf::try_from(self.data.clone())
            .map_err(|_| SignerError::InvalidInput("memo too large".into()))?;
        Ok(Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(&data)
            .into_script())
    }
}

/// Result of the sizing passes, before any real signature is produced.
#[derive(Debug, Clone)]
pub struct ChangeEstimate {
    pub total_input: u64,
    pub total_output: u64,
    /// `total_input - total_output - fee_with_change`; may be negative.
    pub change: i64,
    pub fee_with_change: u64,
    pub fee_without_change: u64,
    /// Whether the change output survives the dust check.
    pub change_kept: bool,
    /// Sigop-adjusted vsize of the chosen layout.
    pub vsize: u64,
    /// The signed sizing transaction for the chosen layout.
    pub estimate: Transaction,
}

impl ChangeEstimate {
    /// The fee the chosen layout is priced at.
    pub fn fee(&self) -> u64 {
        if self.change_kept {
            self.fee_with_change
        } else {
            self.fee_without_change
        }
    }

    /// Whether the inputs cover the outputs and the fee without change.
    pub fn is_funded(&self) -> bool {
        self.surplus() >= 0
    }

    /// What remains after paying outputs and the fee of the chosen layout.
    pub fn surplus(&self) -> i128 {
        i128::from(self.total_input) - i128::from(self.total_output) - i128::from(self.fee())
    }
}

fn overflow(what: &str) -> SignerError {
    SignerError::InvalidInput(format!("{what} overflows the satoshi range"))
}

fn sum_sats<'a>(outputs: impl IntoIterator<Item = &'a TxOut>, what: &str) -> Result<u64> {
    outputs
        .into_iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.value.to_sat()))
        .ok_or_else(|| overflow(what))
}

#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub tx: Transaction,
    /// Consensus-serialized `tx`.
    pub bytes: Vec<u8>,
    /// Fee the transaction was priced at.
    pub fee: u64,
    /// Sigop-adjusted vsize the fee was computed from.
    pub vsize: u64,
    /// Raw change amount; negative when the inputs fall short.
    pub change: i64,
    pub change_index: Option<usize>,
    /// Sighashes recorded for deferred signers.
    pub context: SigningContext,
}

impl BuiltTransaction {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

struct ResolvedInput {
    address_type: AddressType,
    spend: InputSpend,
    sequence: Sequence,
    signer: Option<Signer>,
}

struct Resolved {
    inputs: Vec<ResolvedInput>,
    prevouts: Vec<TxOut>,
    payments: Vec<TxOut>,
    change_script: ScriptBuf,
}

/// Fee-aware builder: prices the transaction by dry-run signing, decides
/// whether change is worth keeping, then signs for real.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    network: NetworkParams,
    inputs: Vec<UnsignedInput>,
    outputs: Vec<UnsignedOutput>,
    change: ScriptSource,
    fee_rate: u64,
    dust_threshold: u64,
    memo: Option<Memo>,
    signer: Option<Signer>,
    options: BuildOptions,
}

impl TransactionBuilder {
    /// `fee_rate` is in satoshis per sigop-adjusted vbyte.
    pub fn new(
        network: NetworkParams,
        inputs: Vec<UnsignedInput>,
        outputs: Vec<UnsignedOutput>,
        change: ScriptSource,
        fee_rate: u64,
        dust_threshold: u64,
    ) -> Self {
        TransactionBuilder {
            network,
            inputs,
            outputs,
            change,
            fee_rate,
            dust_threshold,
            memo: None,
            signer: None,
            options: BuildOptions::default(),
        }
    }

    pub fn memo(mut self, memo: Memo) -> Self {
        self.memo = Some(memo);
        self
    }

    /// Signer for inputs that carry no private key of their own.
    pub fn signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<UnsignedInput>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn inputs(&self) -> &[UnsignedInput] {
        &self.inputs
    }

    pub fn network(&self) -> &NetworkParams {
        &self.network
    }

    fn resolve(&self) -> Result<Resolved> {
        if self.inputs.is_empty() {
            return Err(SignerError::InvalidInput("no inputs".into()));
        }
        let default_sequence = Sequence(self.options.default_sequence);

        let mut inputs = Vec::with_capacity(self.inputs.len());
        let mut prevouts = Vec::with_capacity(self.inputs.len());
        for (index, input) in self.inputs.iter().enumerate() {
            let script_pubkey = input.source.script_pubkey(&self.network)?;
            let address_type = input.source.address_type(&self.network)?;
            input.check_prev_tx(index, &script_pubkey)?;

            let signer = match (&input.private_key, &self.signer) {
                (Some(key), _) => Some(Signer::LocalKey(*key)),
                (None, signer) => signer.clone(),
            };
            inputs.push(ResolvedInput {
                address_type,
                spend: input.spend(),
                sequence: input.sequence.unwrap_or(default_sequence),
                signer,
            });
            prevouts.push(TxOut {
                value: Amount::from_sat(input.amount),
                script_pubkey,
            });
        }

        let mut payments = self
            .outputs
            .iter()
            .map(|output| {
                Ok(TxOut {
                    value: Amount::from_sat(output.amount),
                    script_pubkey: output.destination.script_pubkey(&self.network)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(memo) = &self.memo {
            let position = memo.position.unwrap_or(payments.len()).min(payments.len());
            payments.insert(
                position,
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: memo.script()?,
                },
            );
        }

        Ok(Resolved {
            inputs,
            prevouts,
            payments,
            change_script: self.change.script_pubkey(&self.network)?,
        })
    }

    fn assemble(&self, resolved: &Resolved, change: Option<u64>) -> Transaction {
        let mut output = resolved.payments.clone();
        if let Some(value) = change {
            output.push(TxOut {
                value: Amount::from_sat(value),
                script_pubkey: resolved.change_script.clone(),
            });
        }
        Transaction {
            version: Version(self.options.version),
            lock_time: LockTime::from_consensus(self.options.lock_time),
            input: self
                .inputs
                .iter()
                .zip(&resolved.inputs)
                .map(|(input, resolved)| TxIn {
                    previous_output: input.outpoint(),
                    script_sig: ScriptBuf::new(),
                    sequence: resolved.sequence,
                    witness: Witness::new(),
                })
                .collect(),
            output,
        }
    }

    /// Sign a fresh sizing transaction and return it with its adjusted vsize.
    ///
    /// Inputs with a local key sign with it; every other input signs with
    /// the placeholder key.
    fn size(&self, resolved: &Resolved, change: Option<u64>) -> Result<(Transaction, u64)> {
        let mut tx = self.assemble(resolved, change);
        let mut ctx = SigningContext::deterministic();
        let placeholder = Signer::LocalKey(estimate_secret_key()?);

        for (index, input) in resolved.inputs.iter().enumerate() {
            let signer = match &input.signer {
                Some(signer @ Signer::LocalKey(_)) => signer,
                _ => &placeholder,
            };
            sign_input(
                &mut tx,
                index,
                input.address_type,
                signer,
                &resolved.prevouts,
                &input.spend,
                &mut ctx,
            )?;
        }
        let vsize = adjusted_vsize(&tx, &resolved.prevouts);
        Ok((tx, vsize))
    }

    fn fee_for(&self, vsize: u64) -> Result<u64> {
        vsize.checked_mul(self.fee_rate).ok_or_else(|| overflow("fee"))
    }

    fn estimate_resolved(&self, resolved: &Resolved) -> Result<ChangeEstimate> {
        let total_input = sum_sats(&resolved.prevouts, "input total")?;
        let total_output = sum_sats(&resolved.payments, "output total")?;

        let (with_change, vsize_with) = self.size(resolved, Some(0))?;
        let fee_with_change = self.fee_for(vsize_with)?;
        let change = i128::from(total_input) - i128::from(total_output) - i128::from(fee_with_change);
        let change = i64::try_from(change).map_err(|_| overflow("change"))?;

        let (without_change, vsize_without) = self.size(resolved, None)?;
        let fee_without_change = self.fee_for(vsize_without)?;

        let change_kept = i128::from(change) > i128::from(self.dust_threshold);
        debug!(
            total_input,
            total_output,
            vsize_with,
            vsize_without,
            fee_with_change,
            fee_without_change,
            change,
            change_kept,
            "sized transaction"
        );

        let (vsize, estimate) = if change_kept {
            (vsize_with, with_change)
        } else {
            (vsize_without, without_change)
        };
        let estimate = ChangeEstimate {
            total_input,
            total_output,
            change,
            fee_with_change,
            fee_without_change,
            change_kept,
            vsize,
            estimate,
        };
        if !estimate.is_funded() {
            warn!(
                surplus = estimate.surplus(),
                "inputs do not cover outputs and fee"
            );
        }
        Ok(estimate)
    }

    /// Run the sizing passes only. No real key is needed.
    pub fn estimate_change(&self) -> Result<ChangeEstimate> {
        let resolved = self.resolve()?;
        self.estimate_resolved(&resolved)
    }

    /// Size, then sign the final transaction.
    ///
    /// A negative change amount does not fail the build; it is reported in
    /// [`BuiltTransaction::change`] for the caller to reject.
    pub fn build(&self) -> Result<BuiltTransaction> {
        let resolved = self.resolve()?;
        let estimate = self.estimate_resolved(&resolved)?;

        let change_value = estimate.change_kept.then_some(estimate.change as u64);
        let mut tx = self.assemble(&resolved, change_value);
        let mut context = SigningContext::randomized();

        for (index, input) in resolved.inputs.iter().enumerate() {
            let signer = input
                .signer
                .as_ref()
                .ok_or(SignerError::MissingKeyMaterial { input_index: index })?;
            sign_input(
                &mut tx,
                index,
                input.address_type,
                signer,
                &resolved.prevouts,
                &input.spend,
                &mut context,
            )?;
        }

        if self.options.verify_signatures {
            for (index, input) in resolved.inputs.iter().enumerate() {
                if let Some(signer @ Signer::LocalKey(_)) = &input.signer {
                    verify_input(
                        &tx,
                        index,
                        input.address_type,
                        &resolved.prevouts,
                        &input.spend,
                        &signer.public_key(),
                    )?;
                }
            }
        }

        let bytes = bitcoin::consensus::serialize(&tx);
        let change_index = estimate.change_kept.then(|| tx.output.len() - 1);
        info!(
            txid = %tx.compute_txid(),
            inputs = tx.input.len(),
            outputs = tx.output.len(),
            fee = estimate.fee(),
            vsize = estimate.vsize,
            deferred = context.deferred.len(),
            "built transaction"
        );

        Ok(BuiltTransaction {
            tx,
            bytes,
            fee: estimate.fee(),
            vsize: estimate.vsize,
            change: estimate.change,
            change_index,
            context,
        })
    }

    /// Unsigned PSBT for the same layout [`build`](Self::build) would sign,
    /// with the per-input data an external signer needs.
    pub fn build_psbt(&self) -> Result<Psbt> {
        let resolved = self.resolve()?;
        let estimate = self.estimate_resolved(&resolved)?;
        let tx = self.assemble(&resolved, estimate.change_kept.then_some(estimate.change as u64));

        let mut psbt = Psbt::from_unsigned_tx(tx)
            .map_err(|e| SignerError::MalformedPsbt(format!("unsigned tx rejected: {e}")))?;

        for (index, ((input, resolved_input), prevout)) in self
            .inputs
            .iter()
            .zip(&resolved.inputs)
            .zip(&resolved.prevouts)
            .enumerate()
        {
            let psbt_input = &mut psbt.inputs[index];
            psbt_input.witness_utxo = Some(prevout.clone());
            psbt_input.non_witness_utxo = input.prev_tx.clone();
            psbt_input.sighash_type = input.sighash_type.map(PsbtSighashType::from_u32);

            let public_key = resolved_input.signer.as_ref().map(Signer::public_key);
            match resolved_input.address_type {
                AddressType::SegwitNested => {
                    psbt_input.redeem_script = public_key.as_ref().map(p2wpkh_script);
                }
                AddressType::SegwitTaproot => {
                    if let Some(public_key) = public_key {
                        psbt_input.tap_internal_key = Some(public_key.x_only_public_key().0);
                    }
                    match &resolved_input.spend.taproot {
                        TaprootSpend::KeyPath { merkle_root } => {
                            psbt_input.tap_merkle_root = *merkle_root;
                        }
                        TaprootSpend::ScriptPath(leaf) => {
                            psbt_input.tap_scripts.insert(
                                leaf.control_block.clone(),
                                (leaf.leaf_script.clone(), leaf.control_block.leaf_version),
                            );
                        }
                        TaprootSpend::UntweakedKeyPath => {}
                    }
                }
                AddressType::Legacy | AddressType::SegwitNative => {}
            }
        }
        debug!(inputs = psbt.inputs.len(), "built unsigned psbt");
        Ok(psbt)
    }
}
