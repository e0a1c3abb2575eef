//! Legacy (pre-segwit style) signature hashing.

use pivxd_consensus::Hash256;
use pivxd_primitives::encoding::{Encodable, Encoder};
use pivxd_primitives::hash::sha256d;
use pivxd_primitives::transaction::{Transaction, TX_TYPE_NORMAL};

use crate::opcodes::{Instructions, OP_CODESEPARATOR};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Digest returned for out-of-range inputs and unmatched `SIGHASH_SINGLE`.
pub const SIGHASH_ONE: Hash256 = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    pub fn is_defined(self) -> bool {
        let base = self.0 & !SIGHASH_ANYONECANPAY;
        (SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base)
    }
}

/// Computes the digest signed by input `input_index` of `tx`, committing to
/// `script_code` with every `OP_CODESEPARATOR` removed.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Hash256 {
    if input_index >= tx.vin.len() {
        return SIGHASH_ONE;
    }
    let base = sighash_type.base_type();
    let hash_single = base == SIGHASH_SINGLE;
    let hash_none = base == SIGHASH_NONE;
    if hash_single && input_index >= tx.vout.len() {
        return SIGHASH_ONE;
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let script_code = strip_code_separators(script_code);

    let mut encoder = Encoder::with_capacity(128 + script_code.len());
    encoder.write_i16_le(tx.version);
    encoder.write_i16_le(tx.tx_type);

    let signed_inputs = if anyone_can_pay {
        input_index..input_index + 1
    } else {
        0..tx.vin.len()
    };
    encoder.write_varint(signed_inputs.len() as u64);
    for index in signed_inputs {
        let input = &tx.vin[index];
        input.prevout.consensus_encode(&mut encoder);
        if index == input_index {
            encoder.write_var_bytes(&script_code);
            encoder.write_u32_le(input.sequence);
        } else {
            encoder.write_varint(0);
            let sequence = if hash_single || hash_none { 0 } else { input.sequence };
            encoder.write_u32_le(sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.vout.len()
    };
    encoder.write_varint(output_count as u64);
    for (index, output) in tx.vout.iter().take(output_count).enumerate() {
        if hash_single && index != input_index {
            encoder.write_i64_le(-1);
            encoder.write_varint(0);
        } else {
            output.consensus_encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    if tx.is_sapling_version() && tx.tx_type != TX_TYPE_NORMAL {
        match &tx.extra_payload {
            Some(payload) => {
                encoder.write_bool(true);
                encoder.write_var_bytes(payload);
            }
            None => encoder.write_bool(false),
        }
    }
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}

fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut instructions = Instructions::new(script);
    let mut start = 0usize;
    while let Some(instruction) = instructions.next() {
        let end = instructions.position();
        match instruction {
            Ok(instruction) if instruction.opcode == OP_CODESEPARATOR => {}
            Ok(_) => out.extend_from_slice(&script[start..end]),
            Err(_) => {
                out.extend_from_slice(&script[start..]);
                break;
            }
        }
        start = end;
    }
    out
}
