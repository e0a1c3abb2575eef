//! Standard script templates.

use crate::opcodes::*;

/// Result of matching a scriptPubKey against the standard templates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig { required: u8, keys: u8 },
    NullData,
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_pay_to_script_hash(script) {
        ScriptType::ScriptHash
    } else if is_p2pkh(script) {
        ScriptType::PubKeyHash
    } else if is_p2pk(script) {
        ScriptType::PubKey
    } else if is_null_data(script) {
        ScriptType::NullData
    } else if let Some((required, keys)) = match_multisig(script) {
        ScriptType::Multisig { required, keys }
    } else {
        ScriptType::NonStandard
    }
}

/// Returns the template of `script` if relay policy accepts it as an output.
pub fn standard_output_type(script: &[u8], max_data_carrier_bytes: usize) -> Option<ScriptType> {
    match classify_script_pubkey(script) {
        ScriptType::NonStandard => None,
        ScriptType::Multisig { required, keys } => {
            (keys <= 3 && required >= 1 && required <= keys).then_some(ScriptType::Multisig {
                required,
                keys,
            })
        }
        ScriptType::NullData => {
            (script.len() <= max_data_carrier_bytes).then_some(ScriptType::NullData)
        }
        other => Some(other),
    }
}

/// Number of scriptSig pushes a spend of `script_type` consumes, excluding any P2SH redeem script.
pub fn script_sig_args_expected(script_type: ScriptType) -> Option<usize> {
    match script_type {
        ScriptType::NonStandard | ScriptType::NullData => None,
        ScriptType::PubKey => Some(1),
        ScriptType::PubKeyHash => Some(2),
        ScriptType::ScriptHash => Some(1),
        ScriptType::Multisig { required, .. } => Some(usize::from(required) + 1),
    }
}

pub fn is_pay_to_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// True when the output can never be spent, so it is left out of the coin set.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN) || script.len() > pivxd_consensus::constants::MAX_SCRIPT_SIZE
}

pub fn is_push_only(script: &[u8]) -> bool {
    Instructions::new(script).all(|instruction| {
        instruction.is_ok_and(|instruction| instruction.opcode <= OP_16)
    })
}

/// The pushed elements of a push-only script, or `None` if it contains other opcodes.
pub fn push_elements(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut elements = Vec::new();
    for instruction in Instructions::new(script) {
        let instruction = instruction.ok()?;
        match instruction.opcode {
            opcode if opcode <= OP_PUSHDATA4 => elements.push(instruction.data.to_vec()),
            OP_1NEGATE => elements.push(vec![0x81]),
            opcode @ OP_1..=OP_16 => elements.push(vec![opcode - OP_1 + 1]),
            _ => return None,
        }
    }
    Some(elements)
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2pk(script: &[u8]) -> bool {
    match script.first().copied() {
        Some(len @ (33 | 65)) => {
            script.len() == usize::from(len) + 2 && script[script.len() - 1] == OP_CHECKSIG
        }
        _ => false,
    }
}

fn is_null_data(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN) && is_push_only(&script[1..])
}

fn match_multisig(script: &[u8]) -> Option<(u8, u8)> {
    let (&last, body) = script.split_last()?;
    if last != OP_CHECKMULTISIG {
        return None;
    }
    let mut instructions = Instructions::new(body);
    let required = decode_small_int(instructions.next()?.ok()?.opcode)?;
    let mut keys = 0u8;
    let mut tail = None;
    for instruction in instructions {
        let instruction = instruction.ok()?;
        match instruction.data.len() {
            33 | 65 if tail.is_none() => keys += 1,
            _ => {
                if tail.is_some() {
                    return None;
                }
                tail = Some(instruction.opcode);
            }
        }
    }
    let declared = decode_small_int(tail?)?;
    if required == 0 || declared != keys || required > keys {
        return None;
    }
    Some((required, keys))
}
