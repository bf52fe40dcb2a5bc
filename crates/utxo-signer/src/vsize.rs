//! Sigop-adjusted virtual size, used to price transactions.
//!
//! Mirrors the relay policy of the reference client: a transaction is billed
//! for `max(weight, sigop_cost * BYTES_PER_SIGOP)` weight units, so scripts
//! dense in signature checks cannot be underpriced.

use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY, OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_PUSHNUM_1,
    OP_PUSHNUM_16,
};
use bitcoin::script::{Instruction, Script};
use bitcoin::{Transaction, TxOut, Witness};

/// Sigops charged for a multisig check whose key count is not known.
pub const MAX_PUBKEYS_PER_MULTISIG: u64 = 20;

pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// Policy weight charged per sigop (`-bytespersigop`).
pub const BYTES_PER_SIGOP: u64 = 20;

/// Virtual bytes billed per unit of sigop cost.
pub const SIGOP_VBYTES: u64 = BYTES_PER_SIGOP / WITNESS_SCALE_FACTOR;

/// Count signature operations in `script`.
///
/// With `accurate` set, a CHECKMULTISIG preceded by OP_1..OP_16 counts as
/// that many sigops; otherwise, or without such a push, it counts as 20.
pub fn count_sigops(script: &Script, accurate: bool) -> u64 {
    let pushnum = OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8();
    let mut count = 0u64;
    let mut last_op = None;

    for instruction in script.instructions() {
        // Parsing stops at the first malformed push.
        let Ok(instruction) = instruction else { break };
        match instruction {
            Instruction::Op(op) => {
                if op == OP_CHECKSIG || op == OP_CHECKSIGVERIFY {
                    count += 1;
                } else if op == OP_CHECKMULTISIG || op == OP_CHECKMULTISIGVERIFY {
                    count += match last_op {
                        Some(prev) if accurate && pushnum.contains(&prev) => {
                            u64::from(prev - OP_PUSHNUM_1.to_u8() + 1)
                        }
                        _ => MAX_PUBKEYS_PER_MULTISIG,
                    };
                }
                last_op = Some(op.to_u8());
            }
            Instruction::PushBytes(_) => last_op = None,
        }
    }
    count
}

fn last_push(script: &Script) -> Option<&[u8]> {
    let mut last = None;
    for instruction in script.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) => last = Some(bytes.as_bytes()),
            Ok(Instruction::Op(_)) => {}
            Err(_) => return None,
        }
    }
    last
}

fn witness_sigops(program: &Script, witness: &Witness) -> u64 {
    if program.is_p2wpkh() {
        1
    } else if program.is_p2wsh() {
        witness
            .last()
            .map(|witness_script| count_sigops(Script::from_bytes(witness_script), true))
            .unwrap_or(0)
    } else {
        0
    }
}

/// Total sigop cost in weight-scaled units.
///
/// `prevouts` must list the outputs spent by `tx`'s inputs, in order; inputs
/// without a matching prevout contribute only their scriptSig.
pub fn sigop_cost(tx: &Transaction, prevouts: &[TxOut]) -> u64 {
    let legacy: u64 = tx
        .input
        .iter()
        .map(|input| count_sigops(&input.script_sig, false))
        .chain(tx.output.iter().map(|output| count_sigops(&output.script_pubkey, false)))
        .sum();
    let mut cost = legacy * WITNESS_SCALE_FACTOR;

    for (input, prevout) in tx.input.iter().zip(prevouts) {
        let script_pubkey = &prevout.script_pubkey;
        if script_pubkey.is_p2sh() {
            if let Some(redeem) = last_push(&input.script_sig) {
                let redeem = Script::from_bytes(redeem);
                cost += count_sigops(redeem, true) * WITNESS_SCALE_FACTOR;
                cost += witness_sigops(redeem, &input.witness);
            }
        } else {
            cost += witness_sigops(script_pubkey, &input.witness);
        }
    }
    cost
}

/// Plain BIP-141 virtual size, rounded up.
pub fn virtual_size(tx: &Transaction) -> u64 {
    tx.weight().to_vbytes_ceil()
}

/// Virtual size used for fee estimation: never below the sigop-equivalent size.
pub fn adjusted_vsize(tx: &Transaction, prevouts: &[TxOut]) -> u64 {
    virtual_size(tx).max(sigop_cost(tx, prevouts) * SIGOP_VBYTES)
}
