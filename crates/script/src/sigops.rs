//! Signature-operation counting.

use pivxd_primitives::transaction::Transaction;

use crate::interpreter::MAX_PUBKEYS_PER_MULTISIG;
use crate::opcodes::*;
use crate::standard::{is_pay_to_script_hash, push_elements};

/// Counts sigops in `script`. With `accurate`, a multisig preceded by a small
/// integer counts that many keys instead of the maximum.
pub fn script_sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = OP_RESERVED;
    for instruction in Instructions::new(script) {
        let Ok(instruction) = instruction else {
            break;
        };
        match instruction.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match decode_small_int(last_opcode) {
                    Some(keys) if accurate && keys > 0 => u32::from(keys),
                    _ => MAX_PUBKEYS_PER_MULTISIG as u32,
                };
            }
            _ => {}
        }
        last_opcode = instruction.opcode;
    }
    count
}

/// Sigops inside the redeem script carried by `script_sig`, for a spend of `script_pubkey`.
pub fn p2sh_sigop_count(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_pay_to_script_hash(script_pubkey) {
        return script_sigop_count(script_pubkey, true);
    }
    match push_elements(script_sig).and_then(|mut pushes| pushes.pop()) {
        Some(redeem_script) => script_sigop_count(&redeem_script, true),
        None => 0,
    }
}

/// Legacy per-transaction count over every scriptSig and scriptPubKey.
pub fn legacy_sigop_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| script_sigop_count(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| script_sigop_count(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}
