//! Cross-module integration tests exercising the full pipeline:
//! key -> address -> build/sign -> verify, plus the PSBT and
//! commit/reveal flows on top of the same building blocks.
//!
//! Everything goes through the public API of utxo_signer.

use bitcoin::opcodes::all::{OP_CHECKSIG, OP_ENDIF, OP_IF};
use bitcoin::opcodes::OP_FALSE;
use bitcoin::script::{Builder, PushBytesBuf, ScriptBuf};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::TxOut;

use utxo_signer::address::{
    classify, p2pkh_address, p2sh_p2wpkh_address, p2tr_address, p2wpkh_address, AddressType,
    ScriptSource,
};
use utxo_signer::commit_reveal::{plan, CommitRevealPlan, CommitRevealRequest, Envelope, RevealMode};
use utxo_signer::network::{NetworkParams, BITCOIN, DOGECOIN, LITECOIN};
use utxo_signer::psbt::{
    extract_transaction, finalize_all_inputs, parse_psbt_base64, serialize_psbt_base64,
    sign_inputs,
};
use utxo_signer::signer::{verify_input, InputSpend, Signer, TapLeafSpend, TaprootSpend};
use utxo_signer::taproot::single_leaf_tree;
use utxo_signer::transaction::{
    TransactionBuilder, UnsignedInput, UnsignedOutput, DEFAULT_DUST_THRESHOLD,
};
use utxo_signer::utxo::select_inputs;

fn key(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

fn pubkey(byte: u8) -> PublicKey {
    PublicKey::from_secret_key(&Secp256k1::new(), &key(byte))
}

fn address_of(byte: u8, address_type: AddressType, network: &NetworkParams) -> String {
    let pk = pubkey(byte);
    match address_type {
        AddressType::Legacy => p2pkh_address(&pk, network),
        AddressType::SegwitNested => p2sh_p2wpkh_address(&pk, network),
        AddressType::SegwitNative => p2wpkh_address(&pk, network).unwrap(),
        AddressType::SegwitTaproot => p2tr_address(&pk.x_only_public_key().0, network).unwrap(),
    }
}

fn input(tag: u8, byte: u8, address_type: AddressType, network: &NetworkParams, amount: u64) -> UnsignedInput {
    let source = ScriptSource::address(address_of(byte, address_type, network));
    UnsignedInput::new(&hex::encode([tag; 32]), 0, source, amount)
        .unwrap()
        .with_private_key(key(byte))
}

fn prevouts(inputs: &[UnsignedInput], network: &NetworkParams) -> Vec<TxOut> {
    inputs
        .iter()
        .map(|i| TxOut {
            value: bitcoin::Amount::from_sat(i.amount),
            script_pubkey: i.source.script_pubkey(network).unwrap(),
        })
        .collect()
}

// ─── Addresses ─────────────────────────────────────────────────────

#[test]
fn derived_addresses_classify_back() {
    for address_type in [
        AddressType::Legacy,
        AddressType::SegwitNested,
        AddressType::SegwitNative,
        AddressType::SegwitTaproot,
    ] {
        let address = address_of(0x11, address_type, &BITCOIN);
        assert_eq!(classify(&address, &BITCOIN).unwrap(), address_type, "{address}");
    }
    assert!(address_of(0x11, AddressType::SegwitNative, &LITECOIN).starts_with("ltc1q"));
    assert!(address_of(0x11, AddressType::Legacy, &DOGECOIN).starts_with('D'));
}

// ─── Build: mixed inputs -> sign -> verify ─────────────────────────

#[test]
fn btc_mixed_inputs_full_pipeline() {
    let types = [
        AddressType::Legacy,
        AddressType::SegwitNested,
        AddressType::SegwitNative,
        AddressType::SegwitTaproot,
    ];
    let inputs: Vec<UnsignedInput> = types
        .iter()
        .enumerate()
        .map(|(i, t)| input(i as u8 + 1, 0x20 + i as u8, *t, &BITCOIN, 40_000))
        .collect();
    let outputs = vec![UnsignedOutput::to_address(
        address_of(0x50, AddressType::SegwitTaproot, &BITCOIN),
        100_000,
    )];
    let change = ScriptSource::address(address_of(0x51, AddressType::SegwitNative, &BITCOIN));

    let builder = TransactionBuilder::new(
        BITCOIN,
        inputs.clone(),
        outputs,
        change,
        12,
        DEFAULT_DUST_THRESHOLD,
    );
    let estimate = builder.estimate_change().unwrap();
    let built = builder.build().unwrap();

    assert_eq!(built.tx.input.len(), 4);
    assert_eq!(built.change_index, Some(1));
    assert_eq!(built.fee, estimate.fee());
    let total_out: u64 = built.tx.output.iter().map(|o| o.value.to_sat()).sum();
    assert_eq!(160_000 - total_out, built.fee);

    let prevouts = prevouts(&inputs, &BITCOIN);
    for (index, address_type) in types.iter().enumerate() {
        verify_input(
            &built.tx,
            index,
            *address_type,
            &prevouts,
            &InputSpend::default(),
            &pubkey(0x20 + index as u8),
        )
        .unwrap();
    }
}

#[test]
fn litecoin_segwit_pipeline() {
    let inputs = vec![input(0xaa, 0x33, AddressType::SegwitNative, &LITECOIN, 5_000_000)];
    let outputs = vec![UnsignedOutput::to_address(
        address_of(0x34, AddressType::SegwitNative, &LITECOIN),
        1_000_000,
    )];
    let change = ScriptSource::address(address_of(0x33, AddressType::SegwitNested, &LITECOIN));
    let built = TransactionBuilder::new(LITECOIN, inputs.clone(), outputs, change, 2, 10_000)
        .build()
        .unwrap();

    assert_eq!(built.tx.output.len(), 2);
    verify_input(
        &built.tx,
        0,
        AddressType::SegwitNative,
        &prevouts(&inputs, &LITECOIN),
        &InputSpend::default(),
        &pubkey(0x33),
    )
    .unwrap();
}

#[test]
fn dogecoin_legacy_pipeline() {
    let inputs = vec![input(0xbb, 0x44, AddressType::Legacy, &DOGECOIN, 500_000_000)];
    let outputs = vec![UnsignedOutput::to_address(
        address_of(0x45, AddressType::Legacy, &DOGECOIN),
        100_000_000,
    )];
    let change = ScriptSource::address(address_of(0x44, AddressType::Legacy, &DOGECOIN));
    let built = TransactionBuilder::new(DOGECOIN, inputs.clone(), outputs, change, 1_000, 1_000_000)
        .build()
        .unwrap();

    assert!(built.tx.input[0].witness.is_empty());
    assert!(!built.tx.input[0].script_sig.is_empty());
    verify_input(
        &built.tx,
        0,
        AddressType::Legacy,
        &prevouts(&inputs, &DOGECOIN),
        &InputSpend::default(),
        &pubkey(0x44),
    )
    .unwrap();

    // Segwit destinations do not exist on this chain.
    let bad = TransactionBuilder::new(
        DOGECOIN,
        inputs,
        vec![UnsignedOutput::to_address(
            address_of(0x45, AddressType::SegwitNative, &BITCOIN),
            100_000_000,
        )],
        ScriptSource::address(address_of(0x44, AddressType::Legacy, &DOGECOIN)),
        1_000,
        1_000_000,
    );
    assert!(bad.build().is_err());
}

#[test]
fn select_then_build() {
    let candidates = vec![
        input(0x01, 0x61, AddressType::SegwitNative, &BITCOIN, 20_000),
        input(0x02, 0x61, AddressType::SegwitNative, &BITCOIN, 70_000),
        input(0x03, 0x61, AddressType::SegwitNative, &BITCOIN, 30_000),
    ];
    let template = TransactionBuilder::new(
        BITCOIN,
        Vec::new(),
        vec![UnsignedOutput::to_address(
            address_of(0x62, AddressType::SegwitNative, &BITCOIN),
            80_000,
        )],
        ScriptSource::address(address_of(0x61, AddressType::SegwitNative, &BITCOIN)),
        5,
        DEFAULT_DUST_THRESHOLD,
    );

    let selection = select_inputs(&candidates, &template).unwrap();
    assert_eq!(selection.selected.len(), 2);
    assert_eq!(selection.total, 100_000);

    let built = template.with_inputs(selection.selected).build().unwrap();
    assert_eq!(built.fee, selection.estimate.fee());
    assert!(built.change > 0);
}

// ─── PSBT: build -> encode -> sign -> finalize -> extract ──────────

#[test]
fn psbt_round_trip_pipeline() {
    let inputs = vec![
        input(0x0a, 0x71, AddressType::SegwitNative, &BITCOIN, 60_000),
        input(0x0b, 0x71, AddressType::SegwitTaproot, &BITCOIN, 60_000),
        input(0x0c, 0x71, AddressType::SegwitNested, &BITCOIN, 60_000),
    ];
    let builder = TransactionBuilder::new(
        BITCOIN,
        inputs.clone(),
        vec![UnsignedOutput::to_address(
            address_of(0x72, AddressType::SegwitNative, &BITCOIN),
            150_000,
        )],
        ScriptSource::address(address_of(0x71, AddressType::SegwitNative, &BITCOIN)),
        3,
        DEFAULT_DUST_THRESHOLD,
    );

    let encoded = serialize_psbt_base64(&builder.build_psbt().unwrap());
    let mut psbt = parse_psbt_base64(&encoded).unwrap();

    let report = sign_inputs(&mut psbt, &Signer::LocalKey(key(0x71)), &[], None).unwrap();
    assert_eq!(report.signed, vec![0, 1, 2]);
    assert!(report.failed.is_empty());

    let finalized = finalize_all_inputs(&mut psbt);
    assert!(finalized.is_complete());

    let tx = extract_transaction(&psbt);
    let prevouts = prevouts(&inputs, &BITCOIN);
    for (index, address_type) in [
        AddressType::SegwitNative,
        AddressType::SegwitTaproot,
        AddressType::SegwitNested,
    ]
    .into_iter()
    .enumerate()
    {
        verify_input(&tx, index, address_type, &prevouts, &InputSpend::default(), &pubkey(0x71))
            .unwrap();
    }
}

// ─── Commit/reveal ─────────────────────────────────────────────────

fn ord_envelope(reveal_key: &PublicKey, content_type: &[u8], body: &[u8]) -> ScriptBuf {
    let push = |bytes: &[u8]| PushBytesBuf::try_from(bytes.to_vec()).unwrap();
    let mut builder = Builder::new()
        .push_x_only_key(&reveal_key.x_only_public_key().0)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_FALSE)
        .push_opcode(OP_IF)
        .push_slice(push(b"ord"))
        .push_slice(push(&[1]))
        .push_slice(push(content_type))
        .push_opcode(OP_FALSE);
    for chunk in body.chunks(520) {
        builder = builder.push_slice(push(chunk));
    }
    builder.push_opcode(OP_ENDIF).into_script()
}

#[test]
fn commit_reveal_pipeline() {
    let reveal_key = pubkey(0x81);
    let envelopes: Vec<Envelope> = ["first", "second"]
        .iter()
        .map(|text| Envelope {
            script: ord_envelope(&reveal_key, b"text/plain;charset=utf-8", text.as_bytes()),
            destination: ScriptSource::address(address_of(0x82, AddressType::SegwitTaproot, &BITCOIN)),
        })
        .collect();

    // Funding comes from an input with no key of its own.
    let mut funding = input(0x0d, 0x83, AddressType::SegwitNative, &BITCOIN, 50_000);
    funding.private_key = None;

    let request = CommitRevealRequest {
        inputs: vec![funding],
        envelopes: envelopes.clone(),
        reveal_output_value: 330,
        commit_fee_rate: 4,
        reveal_fee_rate: 6,
        change_address: ScriptSource::address(address_of(0x83, AddressType::SegwitNative, &BITCOIN)),
        min_change_value: DEFAULT_DUST_THRESHOLD,
        funding_signer: Some(Signer::LocalKey(key(0x83))),
        reveal_signer: Signer::LocalKey(key(0x81)),
        mode: RevealMode::Parallel,
    };

    let CommitRevealPlan::Ready(txs) = plan(&BITCOIN, &request).unwrap() else {
        panic!("50k sats should fund two small reveals");
    };
    assert_eq!(txs.reveals.len(), 2);

    for (index, reveal) in txs.reveals.iter().enumerate() {
        let commit_output = txs.commit.tx.output[index].clone();
        assert_eq!(commit_output.value.to_sat(), reveal.required_value);
        assert_eq!(
            reveal.required_value - reveal.tx.output[0].value.to_sat(),
            reveal.fee
        );

        let tree = single_leaf_tree(&reveal_key.x_only_public_key().0, &envelopes[index].script)
            .unwrap();
        let spend = InputSpend {
            sighash_type: None,
            taproot: TaprootSpend::ScriptPath(TapLeafSpend {
                leaf_script: tree.leaf_script.clone(),
                control_block: tree.control_block.clone(),
            }),
        };
        verify_input(
            &reveal.tx,
            0,
            AddressType::SegwitTaproot,
            &[commit_output],
            &spend,
            &reveal_key,
        )
        .unwrap();
    }

    // The same plan with a tiny funding input comes back underfunded.
    let mut poor = request.clone();
    poor.inputs[0].amount = 1_000;
    let CommitRevealPlan::Insufficient(shortfall) = plan(&BITCOIN, &poor).unwrap() else {
        panic!("1000 sats cannot fund the reveals");
    };
    let reveal_total: u64 = txs.reveals.iter().map(|r| r.required_value).sum();
    assert_eq!(shortfall.required, reveal_total + shortfall.commit_fee);
    assert_eq!(shortfall.shortfall, shortfall.required - 1_000);
}
