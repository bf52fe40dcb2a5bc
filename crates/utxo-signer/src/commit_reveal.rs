//! Two-phase commit/reveal for data carried in tapscript leaves.
//!
//! Each envelope is an opaque leaf script. The commit transaction pays to
//! a taproot output committing to that single leaf; the reveal transaction
//! spends it through the script path, which puts the envelope on chain.
//!
//! Reveals are priced first with zero-filled placeholder signatures, then
//! the commit is sized to fund them. A plan that cannot be funded comes back
//! as [`CommitRevealPlan::Insufficient`] with the numbers needed to retry.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::ScriptBuf;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use tracing::{debug, info, warn};

use crate::address::{address_from_script, AddressType, ScriptSource};
use crate::error::{Result, SignerError};
use crate::network::NetworkParams;
use crate::signer::{sign_input, InputSpend, SigningContext, Signer, TapLeafSpend, TaprootSpend};
use crate::taproot::{single_leaf_tree, SingleLeafTree};
use crate::transaction::{BuiltTransaction, TransactionBuilder, UnsignedInput, UnsignedOutput};
use crate::vsize::adjusted_vsize;

/// Largest transaction weight relayed by standard nodes.
pub const MAX_STANDARD_TX_WEIGHT: u64 = 400_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Leaf script; must be satisfiable by a signature from the reveal key.
    pub script: ScriptBuf,
    /// Receives the revealed output.
    pub destination: ScriptSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevealMode {
    /// One commit output per envelope; every reveal spends the commit.
    #[default]
    Parallel,
    /// The commit funds the first envelope only. Each reveal pays its
    /// destination and funds the next envelope's commit output, so later
    /// reveals spend the previous reveal.
    Chained,
}

#[derive(Debug, Clone)]
pub struct CommitRevealRequest {
    pub inputs: Vec<UnsignedInput>,
    pub envelopes: Vec<Envelope>,
    pub reveal_output_value: u64,
    pub commit_fee_rate: u64,
    pub reveal_fee_rate: u64,
    pub change_address: ScriptSource,
    /// Commit change at or below this value is dropped.
    pub min_change_value: u64,
    /// Signs commit inputs without their own key.
    pub funding_signer: Option<Signer>,
    /// Key the envelopes' leaf scripts check; also the taproot internal key.
    pub reveal_signer: Signer,
    pub mode: RevealMode,
}

#[derive(Debug, Clone)]
pub struct RevealTransaction {
    pub tx: Transaction,
    /// Address of the commit output this reveal spends.
    pub commit_address: String,
    /// Value the spent output must carry.
    pub required_value: u64,
    pub fee: u64,
    pub vsize: u64,
}

impl RevealTransaction {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

#[derive(Debug, Clone)]
pub struct CommitRevealTransactions {
    pub commit: BuiltTransaction,
    pub reveals: Vec<RevealTransaction>,
    /// Signing context of the reveal pass. With a deferred reveal signer it
    /// holds one sighash per reveal, in reveal order; each is for input 0
    /// of its own transaction.
    pub reveal_context: SigningContext,
}

/// Numbers reported when the funding inputs cannot cover a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeShortfall {
    /// Commit fee without a change output.
    pub commit_fee: u64,
    pub reveal_fees: Vec<u64>,
    /// Minimum total input value that funds the plan.
    pub required: u64,
    pub available: u64,
    pub shortfall: u64,
}

#[derive(Debug, Clone)]
pub enum CommitRevealPlan {
    Ready(CommitRevealTransactions),
    Insufficient(FeeShortfall),
}

impl CommitRevealPlan {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, CommitRevealPlan::Insufficient(_))
    }
}

/// One envelope's taproot commitment and reveal skeleton.
struct RevealDraft {
    tree: SingleLeafTree,
    spend: InputSpend,
    destination: ScriptBuf,
    fee: u64,
    vsize: u64,
    required_value: u64,
}

fn skeleton(outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::all_zeros(), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

fn reveal_outputs(
    request: &CommitRevealRequest,
    destination: &ScriptBuf,
    next: Option<(&ScriptBuf, u64)>,
) -> Vec<TxOut> {
    let mut outputs = vec![TxOut {
        value: Amount::from_sat(request.reveal_output_value),
        script_pubkey: destination.clone(),
    }];
    if let Some((script, value)) = next {
        outputs.push(TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script.clone(),
        });
    }
    outputs
}

fn check_weight(index: usize, tx: &Transaction) -> Result<()> {
    let weight = tx.weight().to_wu();
    if weight > MAX_STANDARD_TX_WEIGHT {
        return Err(SignerError::TransactionTooLarge {
            index,
            weight,
            limit: MAX_STANDARD_TX_WEIGHT,
        });
    }
    Ok(())
}

fn commit_prevout(draft: &RevealDraft) -> TxOut {
    TxOut {
        value: Amount::from_sat(draft.required_value),
        script_pubkey: draft.tree.script_pubkey(),
    }
}

/// Sign reveal `index` in place and check its final weight.
fn sign_reveal(
    tx: &mut Transaction,
    index: usize,
    signer: &Signer,
    prevout: TxOut,
    spend: &InputSpend,
    ctx: &mut SigningContext,
) -> Result<()> {
    sign_input(
        tx,
        0,
        AddressType::SegwitTaproot,
        signer,
        &[prevout],
        spend,
        ctx,
    )?;
    check_weight(index, tx)
}

/// Build reveal drafts and size them with placeholder signatures.
fn draft_reveals(network: &NetworkParams, request: &CommitRevealRequest) -> Result<Vec<RevealDraft>> {
    let (internal_key, _) = request.reveal_signer.public_key().x_only_public_key();
    let placeholder = Signer::DeferredHash {
        public_key: request.reveal_signer.public_key(),
    };

    let mut drafts = Vec::with_capacity(request.envelopes.len());
    for envelope in &request.envelopes {
        let tree = single_leaf_tree(&internal_key, &envelope.script)?;
        let spend = InputSpend {
            sighash_type: None,
            taproot: TaprootSpend::ScriptPath(TapLeafSpend {
                leaf_script: tree.leaf_script.clone(),
                control_block: tree.control_block.clone(),
            }),
        };
        drafts.push(RevealDraft {
            tree,
            spend,
            destination: envelope.destination.script_pubkey(network)?,
            fee: 0,
            vsize: 0,
            required_value: 0,
        });
    }

    // Output values do not change sizes, so each draft is sized once. In
    // chained mode requirements accumulate from the last reveal backwards.
    let mut next_required = None;
    for index in (0..drafts.len()).rev() {
        let next = match request.mode {
            RevealMode::Chained => next_required,
            RevealMode::Parallel => None,
        };
        let draft = &drafts[index];
        let mut tx = skeleton(reveal_outputs(
            request,
            &draft.destination,
            next.as_ref().map(|(script, value)| (script, *value)),
        ));
        sign_reveal(
            &mut tx,
            index,
            &placeholder,
            commit_prevout(draft),
            &draft.spend,
            &mut SigningContext::deterministic(),
        )?;
        let vsize = adjusted_vsize(&tx, &[commit_prevout(draft)]);
        let overflow = || SignerError::InvalidInput(format!("reveal {index} value overflows"));
        let fee = vsize.checked_mul(request.reveal_fee_rate).ok_or_else(overflow)?;
        let required_value = request
            .reveal_output_value
            .checked_add(fee)
            .and_then(|v| v.checked_add(next.map(|(_, value)| value).unwrap_or(0)))
            .ok_or_else(overflow)?;
        debug!(index, vsize, fee, required_value, "sized reveal");

        let draft = &mut drafts[index];
        draft.vsize = vsize;
        draft.fee = fee;
        draft.required_value = required_value;
        next_required = Some((draft.tree.script_pubkey(), required_value));
    }
    Ok(drafts)
}

/// Plan and, when funded, sign the commit and reveal transactions.
pub fn plan(network: &NetworkParams, request: &CommitRevealRequest) -> Result<CommitRevealPlan> {
    if request.envelopes.is_empty() {
        return Err(SignerError::InvalidInput("no envelopes to reveal".into()));
    }
    if !network.supports_segwit() {
        return Err(SignerError::InvalidInput(format!(
            "{network} has no taproot outputs"
        )));
    }

    // A legacy scriptSig is part of the txid, so a placeholder signature
    // there would leave every reveal spending a commit that never exists.
    let deferred_funding = matches!(request.funding_signer, Some(Signer::DeferredHash { .. }));
    for (index, input) in request.inputs.iter().enumerate() {
        if input.private_key.is_none()
            && deferred_funding
            && input.source.address_type(network)? == AddressType::Legacy
        {
            return Err(SignerError::InvalidInput(format!(
                "commit input {index} is legacy and cannot be signed by a deferred signer"
            )));
        }
    }

    let drafts = draft_reveals(network, request)?;
    let commit_outputs: Vec<UnsignedOutput> = match request.mode {
        RevealMode::Parallel => drafts
            .iter()
            .map(|d| UnsignedOutput::new(ScriptSource::Script(d.tree.script_pubkey()), d.required_value))
            .collect(),
        RevealMode::Chained => vec![UnsignedOutput::new(
            ScriptSource::Script(drafts[0].tree.script_pubkey()),
            drafts[0].required_value,
        )],
    };

    let mut builder = TransactionBuilder::new(
        *network,
        request.inputs.clone(),
        commit_outputs,
        request.change_address.clone(),
        request.commit_fee_rate,
        request.min_change_value,
    );
    if let Some(signer) = &request.funding_signer {
        builder = builder.signer(signer.clone());
    }

    let estimate = builder.estimate_change()?;
    let reveal_fees: Vec<u64> = drafts.iter().map(|d| d.fee).collect();
    if !estimate.is_funded() {
        let required = estimate.total_output.saturating_add(estimate.fee_without_change);
        let shortfall = FeeShortfall {
            commit_fee: estimate.fee_without_change,
            reveal_fees,
            required,
            available: estimate.total_input,
            shortfall: required.saturating_sub(estimate.total_input),
        };
        warn!(
            required = shortfall.required,
            available = shortfall.available,
            shortfall = shortfall.shortfall,
            "commit/reveal plan is underfunded"
        );
        return Ok(CommitRevealPlan::Insufficient(shortfall));
    }

    let commit = builder.build()?;
    let commit_txid = commit.txid();

    let mut reveals: Vec<RevealTransaction> = Vec::with_capacity(drafts.len());
    let mut reveal_context = SigningContext::randomized();
    for (index, draft) in drafts.iter().enumerate() {
        let previous_output = match (request.mode, reveals.last()) {
            (RevealMode::Parallel, _) => OutPoint::new(commit_txid, index as u32),
            (RevealMode::Chained, None) => OutPoint::new(commit_txid, 0),
            (RevealMode::Chained, Some(prev)) => OutPoint::new(prev.txid(), 1),
        };
        let next = match request.mode {
            RevealMode::Chained => drafts
                .get(index + 1)
                .map(|n| (n.tree.script_pubkey(), n.required_value)),
            RevealMode::Parallel => None,
        };

        let mut tx = skeleton(reveal_outputs(
            request,
            &draft.destination,
            next.as_ref().map(|(script, value)| (script, *value)),
        ));
        tx.input[0].previous_output = previous_output;
        sign_reveal(
            &mut tx,
            index,
            &request.reveal_signer,
            commit_prevout(draft),
            &draft.spend,
            &mut reveal_context,
        )?;

        reveals.push(RevealTransaction {
            tx,
            commit_address: address_from_script(&draft.tree.script_pubkey(), network)?,
            required_value: draft.required_value,
            fee: draft.fee,
            vsize: draft.vsize,
        });
    }

    info!(
        commit = %commit_txid,
        reveals = reveals.len(),
        commit_fee = commit.fee,
        reveal_fees = reveal_fees.iter().sum::<u64>(),
        "planned commit/reveal"
    );
    Ok(CommitRevealPlan::Ready(CommitRevealTransactions {
        commit,
        reveals,
        reveal_context,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{p2wpkh_address, script_for_key};
    use crate::crypto::secp;
    use crate::network::{BITCOIN, DOGECOIN};
    use crate::signer::verify_input;
    use bitcoin::opcodes::all::{OP_CHECKSIG, OP_ENDIF, OP_IF};
    use bitcoin::opcodes::OP_FALSE;
    use bitcoin::script::{Builder, PushBytesBuf};
    use bitcoin::secp256k1::{PublicKey, SecretKey, XOnlyPublicKey};

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn pubkey(byte: u8) -> PublicKey {
        PublicKey::from_secret_key(&secp(), &key(byte))
    }

    fn envelope_script(x_only: &XOnlyPublicKey, body: &[u8]) -> ScriptBuf {
        let mut builder = Builder::new()
            .push_x_only_key(x_only)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_FALSE)
            .push_opcode(OP_IF)
            .push_slice(PushBytesBuf::try_from(b"ord".to_vec()).unwrap());
        for chunk in body.chunks(520) {
            builder = builder.push_slice(PushBytesBuf::try_from(chunk.to_vec()).unwrap());
        }
        builder.push_opcode(OP_ENDIF).into_script()
    }

    fn envelopes(count: usize) -> Vec<Envelope> {
        let (x_only, _) = pubkey(0x21).x_only_public_key();
        (0..count)
            .map(|i| Envelope {
                script: envelope_script(&x_only, format!("payload {i}").as_bytes()),
                destination: ScriptSource::address(p2wpkh_address(&pubkey(0x31), &BITCOIN).unwrap()),
            })
            .collect()
    }

    fn funding(amount: u64) -> UnsignedInput {
        let script = script_for_key(&pubkey(7), AddressType::SegwitNative).unwrap();
        UnsignedInput::new(&"ab".repeat(32), 0, ScriptSource::Script(script), amount)
            .unwrap()
            .with_private_key(key(7))
    }

    fn request(amount: u64, count: usize, mode: RevealMode) -> CommitRevealRequest {
        CommitRevealRequest {
            inputs: vec![funding(amount)],
            envelopes: envelopes(count),
            reveal_output_value: 546,
            commit_fee_rate: 5,
            reveal_fee_rate: 8,
            change_address: ScriptSource::address(p2wpkh_address(&pubkey(7), &BITCOIN).unwrap()),
            min_change_value: 546,
            funding_signer: None,
            reveal_signer: Signer::LocalKey(key(0x21)),
            mode,
        }
    }

    fn ready(plan: CommitRevealPlan) -> CommitRevealTransactions {
        match plan {
            CommitRevealPlan::Ready(txs) => txs,
            CommitRevealPlan::Insufficient(s) => panic!("unexpectedly insufficient: {s:?}"),
        }
    }

    fn leaf_spend(envelope: &Envelope) -> (InputSpend, ScriptBuf) {
        let (x_only, _) = pubkey(0x21).x_only_public_key();
        let tree = single_leaf_tree(&x_only, &envelope.script).unwrap();
        let spend = InputSpend {
            sighash_type: None,
            taproot: TaprootSpend::ScriptPath(TapLeafSpend {
                leaf_script: tree.leaf_script.clone(),
                control_block: tree.control_block.clone(),
            }),
        };
        (spend, tree.script_pubkey())
    }

    #[test]
    fn parallel_reveals_spend_commit_outputs() {
        let req = request(100_000, 2, RevealMode::Parallel);
        let txs = ready(plan(&BITCOIN, &req).unwrap());
        let commit_txid = txs.commit.txid();

        assert_eq!(txs.commit.tx.output.len(), 3);
        for (index, reveal) in txs.reveals.iter().enumerate() {
            let outpoint = reveal.tx.input[0].previous_output;
            assert_eq!(outpoint, OutPoint::new(commit_txid, index as u32));

            let commit_output = &txs.commit.tx.output[index];
            assert_eq!(commit_output.value.to_sat(), reveal.required_value);
            assert_eq!(reveal.tx.output.len(), 1);
            assert_eq!(reveal.tx.output[0].value.to_sat(), 546);
            assert_eq!(reveal.required_value - 546, reveal.fee);
            assert!(reveal.commit_address.starts_with("bc1p"));

            let (spend, script_pubkey) = leaf_spend(&req.envelopes[index]);
            assert_eq!(commit_output.script_pubkey, script_pubkey);
            verify_input(
                &reveal.tx,
                0,
                AddressType::SegwitTaproot,
                &[commit_output.clone()],
                &spend,
                &pubkey(0x21),
            )
            .unwrap();

            let witness = &reveal.tx.input[0].witness;
            assert_eq!(witness.len(), 3);
            assert_eq!(witness.nth(1).unwrap(), req.envelopes[index].script.as_bytes());
        }
    }

    #[test]
    fn reveal_fee_matches_final_size() {
        let req = request(100_000, 1, RevealMode::Parallel);
        let txs = ready(plan(&BITCOIN, &req).unwrap());
        let reveal = &txs.reveals[0];
        assert_eq!(reveal.vsize, reveal.tx.weight().to_vbytes_ceil());
        assert_eq!(reveal.fee, reveal.vsize * 8);
    }

    #[test]
    fn chained_reveals_spend_previous_reveal() {
        let req = request(100_000, 3, RevealMode::Chained);
        let txs = ready(plan(&BITCOIN, &req).unwrap());

        // Commit funds only the first envelope, plus change.
        assert_eq!(txs.commit.tx.output.len(), 2);
        assert_eq!(
            txs.reveals[0].tx.input[0].previous_output,
            OutPoint::new(txs.commit.txid(), 0)
        );
        for index in 1..3 {
            let prev = &txs.reveals[index - 1];
            let reveal = &txs.reveals[index];
            assert_eq!(reveal.tx.input[0].previous_output, OutPoint::new(prev.txid(), 1));
            assert_eq!(prev.tx.output[1].value.to_sat(), reveal.required_value);

            let (spend, script_pubkey) = leaf_spend(&req.envelopes[index]);
            assert_eq!(prev.tx.output[1].script_pubkey, script_pubkey);
            verify_input(
                &reveal.tx,
                0,
                AddressType::SegwitTaproot,
                &[prev.tx.output[1].clone()],
                &spend,
                &pubkey(0x21),
            )
            .unwrap();
        }
        assert_eq!(txs.reveals[2].tx.output.len(), 1);

        let chain_total: u64 = txs.reveals.iter().map(|r| r.fee + 546).sum();
        assert_eq!(txs.reveals[0].required_value, chain_total);
    }

    #[test]
    fn insufficiency_boundary_is_exact() {
        let probe = plan(&BITCOIN, &request(1_000, 2, RevealMode::Parallel)).unwrap();
        let CommitRevealPlan::Insufficient(shortfall) = probe else {
            panic!("1000 sats should not fund two reveals");
        };
        assert_eq!(shortfall.available, 1_000);
        assert_eq!(shortfall.reveal_fees.len(), 2);
        assert_eq!(shortfall.shortfall, shortfall.required - 1_000);

        let short = plan(&BITCOIN, &request(shortfall.required - 1, 2, RevealMode::Parallel));
        match short.unwrap() {
            CommitRevealPlan::Insufficient(s) => assert_eq!(s.shortfall, 1),
            CommitRevealPlan::Ready(_) => panic!("one satoshi short must be insufficient"),
        }

        let exact = plan(&BITCOIN, &request(shortfall.required, 2, RevealMode::Parallel)).unwrap();
        assert!(!exact.is_insufficient());
        let txs = ready(exact);
        assert_eq!(txs.commit.fee, shortfall.commit_fee);
        assert_eq!(txs.commit.change_index, None);
        let fees: Vec<u64> = txs.reveals.iter().map(|r| r.fee).collect();
        assert_eq!(fees, shortfall.reveal_fees);
    }

    #[test]
    fn oversized_reveal_is_rejected() {
        let (x_only, _) = pubkey(0x21).x_only_public_key();
        let mut req = request(10_000_000, 1, RevealMode::Parallel);
        req.envelopes[0].script = envelope_script(&x_only, &vec![0xab; 410_000]);
        let err = plan(&BITCOIN, &req);
        assert!(matches!(
            err,
            Err(SignerError::TransactionTooLarge { index: 0, limit: MAX_STANDARD_TX_WEIGHT, .. })
        ));
    }

    #[test]
    fn deferred_reveal_signer_records_sighashes() {
        let mut req = request(100_000, 2, RevealMode::Parallel);
        req.reveal_signer = Signer::DeferredHash {
            public_key: pubkey(0x21),
        };
        let txs = ready(plan(&BITCOIN, &req).unwrap());
        assert_eq!(txs.reveal_context.deferred.len(), 2);
        assert_eq!(txs.reveals[1].tx.input[0].witness.nth(0).unwrap(), &[0u8; 64][..]);
    }

    #[test]
    fn deferred_legacy_funding_is_rejected() {
        let script = script_for_key(&pubkey(7), AddressType::Legacy).unwrap();
        let mut req = request(100_000, 1, RevealMode::Parallel);
        req.inputs = vec![
            UnsignedInput::new(&"ab".repeat(32), 0, ScriptSource::Script(script), 100_000).unwrap(),
        ];
        req.funding_signer = Some(Signer::DeferredHash {
            public_key: pubkey(7),
        });
        assert!(matches!(
            plan(&BITCOIN, &req),
            Err(SignerError::InvalidInput(_))
        ));

        // Witness inputs keep the commit txid stable, so deferred signing works.
        let mut req = request(100_000, 1, RevealMode::Parallel);
        req.inputs[0].private_key = None;
        req.funding_signer = Some(Signer::DeferredHash {
            public_key: pubkey(7),
        });
        let txs = ready(plan(&BITCOIN, &req).unwrap());
        assert_eq!(txs.commit.context.deferred.len(), 1);
        assert_eq!(
            txs.reveals[0].tx.input[0].previous_output.txid,
            txs.commit.tx.compute_txid()
        );
    }

    #[test]
    fn networks_without_taproot_are_rejected() {
        let req = request(100_000, 1, RevealMode::Parallel);
        assert!(matches!(
            plan(&DOGECOIN, &req),
            Err(SignerError::InvalidInput(_))
        ));
    }

    #[test]
    fn no_envelopes_is_invalid() {
        let mut req = request(100_000, 1, RevealMode::Parallel);
        req.envelopes.clear();
        assert!(plan(&BITCOIN, &req).is_err());
    }
}
