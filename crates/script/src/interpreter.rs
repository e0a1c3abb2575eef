//! Script interpreter and input verification.

use std::sync::OnceLock;

use pivxd_consensus::constants::{LOCKTIME_THRESHOLD, MAX_SCRIPT_SIZE};
use pivxd_primitives::hash::{hash160, sha256, sha256d};
use pivxd_primitives::transaction::Transaction;
use ripemd::{Digest, Ripemd160};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha1::Sha1;

use crate::opcodes::*;
use crate::sighash::{signature_hash, SighashType};
use crate::standard::{is_pay_to_script_hash, is_push_only};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;

/// Flags every block must satisfy; failing them is a consensus violation.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
/// Flags enforced on relay; a transaction failing only these is non-standard, not invalid.
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_LOW_S;
pub const STANDARD_NOT_MANDATORY_VERIFY_FLAGS: ScriptFlags =
    STANDARD_SCRIPT_VERIFY_FLAGS & !MANDATORY_SCRIPT_VERIFY_FLAGS;

pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
pub const MAX_OPS_PER_SCRIPT: usize = 201;
pub const MAX_STACK_SIZE: usize = 1000;
pub const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;

const DEFAULT_NUM_SIZE: usize = 4;
const LOCKTIME_NUM_SIZE: usize = 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    EvalFalse,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    SigCount,
    PubkeyCount,
    Verify,
    EqualVerify,
    CheckSigVerify,
    CheckMultisigVerify,
    NumEqualVerify,
    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    InvalidAltstackOperation,
    UnbalancedConditional,
    NegativeLockTime,
    UnsatisfiedLockTime,
    SigHashType,
    SigDer,
    SigHighS,
    SigNullDummy,
    PubkeyType,
    MinimalData,
    SigPushOnly,
    CleanStack,
    DiscourageUpgradableNops,
    NumOverflow,
    NonMinimalNum,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ScriptError::EvalFalse => {
                "Script evaluated without error but finished with a false/empty top stack element"
            }
            ScriptError::OpReturn => "OP_RETURN was encountered",
            ScriptError::ScriptSize => "Script is too big",
            ScriptError::PushSize => "Push value size limit exceeded",
            ScriptError::OpCount => "Operation limit exceeded",
            ScriptError::StackSize => "Stack size limit exceeded",
            ScriptError::SigCount => "Signature count negative or greater than pubkey count",
            ScriptError::PubkeyCount => "Pubkey count negative or limit exceeded",
            ScriptError::Verify => "Script failed an OP_VERIFY operation",
            ScriptError::EqualVerify => "Script failed an OP_EQUALVERIFY operation",
            ScriptError::CheckSigVerify => "Script failed an OP_CHECKSIGVERIFY operation",
            ScriptError::CheckMultisigVerify => {
                "Script failed an OP_CHECKMULTISIGVERIFY operation"
            }
            ScriptError::NumEqualVerify => "Script failed an OP_NUMEQUALVERIFY operation",
            ScriptError::BadOpcode => "Opcode missing or not understood",
            ScriptError::DisabledOpcode => "Attempted to use a disabled opcode",
            ScriptError::InvalidStackOperation => "Operation not valid with the current stack size",
            ScriptError::InvalidAltstackOperation => {
                "Operation not valid with the current altstack size"
            }
            ScriptError::UnbalancedConditional => "Invalid OP_IF construction",
            ScriptError::NegativeLockTime => "Negative locktime",
            ScriptError::UnsatisfiedLockTime => "Locktime requirement not satisfied",
            ScriptError::SigHashType => "Signature hash type missing or not understood",
            ScriptError::SigDer => "Non-canonical DER signature",
            ScriptError::SigHighS => "Non-canonical signature: S value is unnecessarily high",
            ScriptError::SigNullDummy => "Dummy CHECKMULTISIG argument must be zero",
            ScriptError::PubkeyType => "Public key is neither compressed or uncompressed",
            ScriptError::MinimalData => "Data push larger than necessary",
            ScriptError::SigPushOnly => "Only non-push operators allowed in signatures",
            ScriptError::CleanStack => "Extra items left on stack after execution",
            ScriptError::DiscourageUpgradableNops => "NOPx reserved for soft-fork upgrades",
            ScriptError::NumOverflow => "Script number overflow",
            ScriptError::NonMinimalNum => "Non-minimally encoded script number",
        };
        f.write_str(message)
    }
}

impl std::error::Error for ScriptError {}

impl From<TruncatedScript> for ScriptError {
    fn from(_: TruncatedScript) -> Self {
        ScriptError::BadOpcode
    }
}

/// Signature and lock-time oracle consulted by `OP_CHECKSIG` and friends.
pub trait SignatureChecker {
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool;
    fn check_lock_time(&self, lock_time: i64) -> bool;
}

pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize) -> Self {
        Self { tx, input_index }
    }
}

fn secp256k1_verifier() -> &'static Secp256k1<VerifyOnly> {
    static VERIFIER: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    VERIFIER.get_or_init(Secp256k1::verification_only)
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(&self, signature: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let Some((&hash_type, der)) = signature.split_last() else {
            return false;
        };
        let Ok(mut signature) = Signature::from_der_lax(der) else {
            return false;
        };
        // libsecp256k1 only verifies low-S; high-S is policed by SCRIPT_VERIFY_LOW_S.
        signature.normalize_s();
        let digest = signature_hash(
            self.tx,
            self.input_index,
            script_code,
            SighashType(u32::from(hash_type)),
        );
        let message = Message::from_digest(digest);
        secp256k1_verifier()
            .verify_ecdsa(&message, &signature, &pubkey)
            .is_ok()
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let threshold = i64::from(LOCKTIME_THRESHOLD);
        let tx_lock_time = i64::from(self.tx.lock_time);
        if (tx_lock_time < threshold) != (lock_time < threshold) {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        // A final input would let the lock time be bypassed.
        !self.tx.vin[self.input_index].is_final()
    }
}

pub fn verify_script<C: SignatureChecker>(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: ScriptFlags,
    checker: &C,
) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker)?;
    let stack_copy = if (flags & SCRIPT_VERIFY_P2SH) != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, checker)?;
    if !stack.last().is_some_and(|value| cast_to_bool(value)) {
        return Err(ScriptError::EvalFalse);
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_pay_to_script_hash(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        let redeem_script = stack.pop().ok_or(ScriptError::InvalidStackOperation)?;
        eval_script(&mut stack, &redeem_script, flags, checker)?;
        if !stack.last().is_some_and(|value| cast_to_bool(value)) {
            return Err(ScriptError::EvalFalse);
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

pub fn eval_script<C: SignatureChecker>(
    stack: &mut Vec<Vec<u8>>,
    script: &[u8],
    flags: ScriptFlags,
    checker: &C,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let require_minimal = (flags & SCRIPT_VERIFY_MINIMALDATA) != 0;
    let mut alt_stack: Vec<Vec<u8>> = Vec::new();
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut code_start = 0usize;
    let mut instructions = Instructions::new(script);

    while let Some(instruction) = instructions.next() {
        let Instruction { opcode, data } = instruction?;
        let exec = !exec_stack.contains(&false);

        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if exec && opcode <= OP_PUSHDATA4 {
            if require_minimal && !check_minimal_push(data, opcode) {
                return Err(ScriptError::MinimalData);
            }
            stack.push(data.to_vec());
        } else if exec || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let value = i64::from(opcode) - i64::from(OP_1 - 1);
                    stack.push(encode_num(value));
                }
                OP_NOP => {}
                OP_CHECKLOCKTIMEVERIFY => {
                    if (flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) == 0 {
                        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let lock_time = decode_num(top(stack, 1)?, require_minimal, LOCKTIME_NUM_SIZE)?;
                        if lock_time < 0 {
                            return Err(ScriptError::NegativeLockTime);
                        }
                        if !checker.check_lock_time(lock_time) {
                            return Err(ScriptError::UnsatisfiedLockTime);
                        }
                    }
                }
                OP_NOP1 | OP_NOP3..=OP_NOP10 => {
                    if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                OP_IF | OP_NOTIF => {
                    let mut branch = false;
                    if exec {
                        let value = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        branch = cast_to_bool(&value) == (opcode == OP_IF);
                    }
                    exec_stack.push(branch);
                }
                OP_ELSE => {
                    let last = exec_stack
                        .last_mut()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(&pop(stack)?) {
                        return Err(ScriptError::Verify);
                    }
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                OP_TOALTSTACK => alt_stack.push(pop(stack)?),
                OP_FROMALTSTACK => {
                    let value = alt_stack
                        .pop()
                        .ok_or(ScriptError::InvalidAltstackOperation)?;
                    stack.push(value);
                }
                OP_2DROP => {
                    pop(stack)?;
                    pop(stack)?;
                }
                OP_2DUP => {
                    let a = top(stack, 2)?.clone();
                    let b = top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    let a = top(stack, 3)?.clone();
                    let b = top(stack, 2)?.clone();
                    let c = top(stack, 1)?.clone();
                    stack.extend([a, b, c]);
                }
                OP_2OVER => {
                    let a = top(stack, 4)?.clone();
                    let b = top(stack, 3)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_2ROT => {
                    let len = require_depth(stack, 6)?;
                    let moved: Vec<_> = stack.drain(len - 6..len - 4).collect();
                    stack.extend(moved);
                }
                OP_2SWAP => {
                    let len = require_depth(stack, 4)?;
                    stack.swap(len - 4, len - 2);
                    stack.swap(len - 3, len - 1);
                }
                OP_IFDUP => {
                    let value = top(stack, 1)?;
                    if cast_to_bool(value) {
                        let value = value.clone();
                        stack.push(value);
                    }
                }
                OP_DEPTH => stack.push(encode_num(stack.len() as i64)),
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let value = top(stack, 1)?.clone();
                    stack.push(value);
                }
                OP_NIP => {
                    let len = require_depth(stack, 2)?;
                    stack.remove(len - 2);
                }
                OP_OVER => {
                    let value = top(stack, 2)?.clone();
                    stack.push(value);
                }
                OP_PICK | OP_ROLL => {
                    let n = decode_num(&pop(stack)?, require_minimal, DEFAULT_NUM_SIZE)?;
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let index = stack.len() - 1 - n as usize;
                    let value = if opcode == OP_ROLL {
                        stack.remove(index)
                    } else {
                        stack[index].clone()
                    };
                    stack.push(value);
                }
                OP_ROT => {
                    let len = require_depth(stack, 3)?;
                    let value = stack.remove(len - 3);
                    stack.push(value);
                }
                OP_SWAP => {
                    let len = require_depth(stack, 2)?;
                    stack.swap(len - 2, len - 1);
                }
                OP_TUCK => {
                    let len = require_depth(stack, 2)?;
                    let value = stack[len - 1].clone();
                    stack.insert(len - 2, value);
                }
                OP_SIZE => {
                    let size = top(stack, 1)?.len();
                    stack.push(encode_num(size as i64));
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let a = pop(stack)?;
                    let b = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(encode_bool(equal));
                    }
                }

                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let value = decode_num(&pop(stack)?, require_minimal, DEFAULT_NUM_SIZE)?;
                    let result = match opcode {
                        OP_1ADD => value + 1,
                        OP_1SUB => value - 1,
                        OP_NEGATE => -value,
                        OP_ABS => value.abs(),
                        OP_NOT => i64::from(value == 0),
                        _ => i64::from(value != 0),
                    };
                    stack.push(encode_num(result));
                }
                OP_ADD..=OP_SUB | OP_BOOLAND..=OP_MAX => {
                    let b = decode_num(&pop(stack)?, require_minimal, DEFAULT_NUM_SIZE)?;
                    let a = decode_num(&pop(stack)?, require_minimal, DEFAULT_NUM_SIZE)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => i64::from(a != 0 && b != 0),
                        OP_BOOLOR => i64::from(a != 0 || b != 0),
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => i64::from(a == b),
                        OP_NUMNOTEQUAL => i64::from(a != b),
                        OP_LESSTHAN => i64::from(a < b),
                        OP_GREATERTHAN => i64::from(a > b),
                        OP_LESSTHANOREQUAL => i64::from(a <= b),
                        OP_GREATERTHANOREQUAL => i64::from(a >= b),
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(encode_num(result));
                    }
                }
                OP_WITHIN => {
                    let max = decode_num(&pop(stack)?, require_minimal, DEFAULT_NUM_SIZE)?;
                    let min = decode_num(&pop(stack)?, require_minimal, DEFAULT_NUM_SIZE)?;
                    let value = decode_num(&pop(stack)?, require_minimal, DEFAULT_NUM_SIZE)?;
                    stack.push(encode_bool(min <= value && value < max));
                }

                OP_RIPEMD160 => {
                    let value = pop(stack)?;
                    stack.push(Ripemd160::digest(&value).to_vec());
                }
                OP_SHA1 => {
                    let value = pop(stack)?;
                    stack.push(Sha1::digest(&value).to_vec());
                }
                OP_SHA256 => {
                    let value = pop(stack)?;
                    stack.push(sha256(&value).to_vec());
                }
                OP_HASH160 => {
                    let value = pop(stack)?;
                    stack.push(hash160(&value).to_vec());
                }
                OP_HASH256 => {
                    let value = pop(stack)?;
                    stack.push(sha256d(&value).to_vec());
                }
                OP_CODESEPARATOR => code_start = instructions.position(),

                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = pop(stack)?;
                    let signature = pop(stack)?;
                    let script_code = find_and_delete(&script[code_start..], &signature);
                    check_signature_encoding(&signature, flags)?;
                    check_pubkey_encoding(&pubkey, flags)?;
                    let ok = checker.check_sig(&signature, &pubkey, &script_code);
                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(encode_bool(ok));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let ok = eval_checkmultisig(
                        stack,
                        &script[code_start..],
                        flags,
                        checker,
                        &mut op_count,
                    )?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !ok {
                            return Err(ScriptError::CheckMultisigVerify);
                        }
                    } else {
                        stack.push(encode_bool(ok));
                    }
                }
                _ => {
                    pivxd_log::log_trace!("bad opcode 0x{opcode:02x}");
                    return Err(ScriptError::BadOpcode);
                }
            }
        }

        if stack.len() + alt_stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn eval_checkmultisig<C: SignatureChecker>(
    stack: &mut Vec<Vec<u8>>,
    code: &[u8],
    flags: ScriptFlags,
    checker: &C,
    op_count: &mut usize,
) -> Result<bool, ScriptError> {
    let require_minimal = (flags & SCRIPT_VERIFY_MINIMALDATA) != 0;
    let mut depth = 1usize;
    let key_count = decode_num(top(stack, depth)?, require_minimal, DEFAULT_NUM_SIZE)?;
    if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&key_count) {
        return Err(ScriptError::PubkeyCount);
    }
    let mut keys_left = key_count as usize;
    *op_count += keys_left;
    if *op_count > MAX_OPS_PER_SCRIPT {
        return Err(ScriptError::OpCount);
    }
    let mut key_depth = depth + 1;
    depth += keys_left + 1;
    let sig_count = decode_num(top(stack, depth)?, require_minimal, DEFAULT_NUM_SIZE)?;
    if sig_count < 0 || sig_count > key_count {
        return Err(ScriptError::SigCount);
    }
    let mut sigs_left = sig_count as usize;
    let mut sig_depth = depth + 1;
    depth += sigs_left + 1;
    require_depth(stack, depth)?;

    let mut script_code = code.to_vec();
    for offset in 0..sigs_left {
        script_code = find_and_delete(&script_code, top(stack, sig_depth + offset)?);
    }

    let mut success = true;
    while success && sigs_left > 0 {
        let signature = top(stack, sig_depth)?;
        let pubkey = top(stack, key_depth)?;
        check_signature_encoding(signature, flags)?;
        check_pubkey_encoding(pubkey, flags)?;
        if checker.check_sig(signature, pubkey, &script_code) {
            sig_depth += 1;
            sigs_left -= 1;
        }
        key_depth += 1;
        keys_left -= 1;
        if sigs_left > keys_left {
            success = false;
        }
    }

    // Everything but the dummy element.
    for _ in 1..depth {
        pop(stack)?;
    }
    let dummy = pop(stack)?;
    if (flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
        return Err(ScriptError::SigNullDummy);
    }
    Ok(success)
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

/// Element `depth` positions from the top (1 is the top).
fn top(stack: &[Vec<u8>], depth: usize) -> Result<&Vec<u8>, ScriptError> {
    stack
        .len()
        .checked_sub(depth)
        .map(|index| &stack[index])
        .ok_or(ScriptError::InvalidStackOperation)
}

fn require_depth(stack: &[Vec<u8>], depth: usize) -> Result<usize, ScriptError> {
    if stack.len() < depth {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(stack.len())
}

fn encode_bool(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

pub fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // Negative zero.
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

pub fn decode_num(data: &[u8], require_minimal: bool, max_len: usize) -> Result<i64, ScriptError> {
    if data.len() > max_len {
        return Err(ScriptError::NumOverflow);
    }
    let Some(&last) = data.last() else {
        return Ok(0);
    };
    if require_minimal && (last & 0x7f) == 0 && (data.len() == 1 || (data[data.len() - 2] & 0x80) == 0)
    {
        return Err(ScriptError::NonMinimalNum);
    }
    let mut result: i64 = 0;
    for (index, byte) in data.iter().enumerate() {
        result |= i64::from(*byte) << (8 * index);
    }
    if (last & 0x80) != 0 {
        result &= !(0x80i64 << (8 * (data.len() - 1)));
        result = -result;
    }
    Ok(result)
}

pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut result = Vec::with_capacity(9);
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = result.last_mut() {
        if (*last & 0x80) != 0 {
            result.push(if negative { 0x80 } else { 0 });
        } else if negative {
            *last |= 0x80;
        }
    }
    result
}

fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    match data {
        [] => opcode == OP_0,
        [value @ 1..=16] => opcode == OP_1 + (value - 1),
        [0x81] => opcode == OP_1NEGATE,
        _ if data.len() <= 75 => usize::from(opcode) == data.len(),
        _ if data.len() <= 255 => opcode == OP_PUSHDATA1,
        _ if data.len() <= 65_535 => opcode == OP_PUSHDATA2,
        _ => true,
    }
}

/// Removes every push of `signature` that starts on an instruction boundary.
fn find_and_delete(script: &[u8], signature: &[u8]) -> Vec<u8> {
    if signature.is_empty() {
        return script.to_vec();
    }
    let mut pattern = Vec::with_capacity(signature.len() + 5);
    push_data(&mut pattern, signature);

    let mut out = Vec::with_capacity(script.len());
    let mut cursor = 0usize;
    while cursor < script.len() {
        while script[cursor..].starts_with(&pattern) {
            cursor += pattern.len();
        }
        if cursor >= script.len() {
            break;
        }
        let start = cursor;
        let mut instructions = Instructions::new(&script[start..]);
        cursor = match instructions.next() {
            Some(Ok(_)) => start + instructions.position(),
            _ => script.len(),
        };
        out.extend_from_slice(&script[start..cursor]);
    }
    out
}

/// Strict DER encoding check with the trailing hash-type byte attached.
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 || usize::from(sig[1]) != sig.len() - 3 {
        return false;
    }
    let len_r = usize::from(sig[3]);
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = usize::from(sig[5 + len_r]);
    if len_r + len_s + 7 != sig.len() {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || (sig[4] & 0x80) != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && (sig[5] & 0x80) == 0 {
        return false;
    }
    let s_start = len_r + 6;
    if sig[len_r + 4] != 0x02 || len_s == 0 || (sig[s_start] & 0x80) != 0 {
        return false;
    }
    !(len_s > 1 && sig[s_start] == 0x00 && (sig[s_start + 1] & 0x80) == 0)
}

fn is_low_der_signature(sig: &[u8]) -> bool {
    let Some((_, der)) = sig.split_last() else {
        return false;
    };
    let Ok(parsed) = Signature::from_der_lax(der) else {
        return false;
    };
    let mut normalized = parsed;
    normalized.normalize_s();
    normalized == parsed
}

fn check_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    // An empty signature is a compact way to provide an invalid one.
    if sig.is_empty() {
        return Ok(());
    }
    let der_flags = SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_STRICTENC;
    if (flags & der_flags) != 0 && !is_valid_signature_encoding(sig) {
        return Err(ScriptError::SigDer);
    }
    if (flags & SCRIPT_VERIFY_LOW_S) != 0 && !is_low_der_signature(sig) {
        return Err(ScriptError::SigHighS);
    }
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 {
        let hash_type = sig.last().copied().unwrap_or_default();
        if !SighashType(u32::from(hash_type)).is_defined() {
            return Err(ScriptError::SigHashType);
        }
    }
    Ok(())
}

fn check_pubkey_encoding(pubkey: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 && !is_compressed_or_uncompressed_pubkey(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

fn is_compressed_or_uncompressed_pubkey(pubkey: &[u8]) -> bool {
    match pubkey.len() {
        33 => pubkey[0] == 0x02 || pubkey[0] == 0x03,
        65 => pubkey[0] == 0x04,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll;

    impl SignatureChecker for AcceptAll {
        fn check_sig(&self, signature: &[u8], _pubkey: &[u8], _script_code: &[u8]) -> bool {
            !signature.is_empty()
        }

        fn check_lock_time(&self, _lock_time: i64) -> bool {
            true
        }
    }

    fn run(script: &[u8], flags: ScriptFlags) -> Result<Vec<Vec<u8>>, ScriptError> {
        let mut stack = Vec::new();
        eval_script(&mut stack, script, flags, &AcceptAll)?;
        Ok(stack)
    }

    #[test]
    fn script_numbers_encode_sign_magnitude() {
        assert_eq!(encode_num(0), Vec::<u8>::new());
        assert_eq!(encode_num(127), vec![0x7f]);
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_num(-1), vec![0x81]);
        assert_eq!(encode_num(-128), vec![0x80, 0x80]);
        for value in [-70_000i64, -255, -1, 0, 1, 255, 70_000] {
            assert_eq!(decode_num(&encode_num(value), true, 4), Ok(value));
        }
        assert_eq!(decode_num(&[0x01, 0x00], true, 4), Err(ScriptError::NonMinimalNum));
        assert_eq!(decode_num(&[1, 2, 3, 4, 5], false, 4), Err(ScriptError::NumOverflow));
    }

    #[test]
    fn arithmetic_and_branches() {
        // 2 3 ADD 5 EQUAL
        let stack = run(&[0x52, 0x53, OP_ADD, 0x55, OP_EQUAL], 0).expect("eval");
        assert_eq!(stack, vec![vec![1]]);

        // 0 IF 2 ELSE 3 ENDIF
        let stack = run(&[OP_0, OP_IF, 0x52, OP_ELSE, 0x53, OP_ENDIF], 0).expect("eval");
        assert_eq!(stack, vec![vec![3]]);

        assert_eq!(run(&[OP_1, OP_IF], 0), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&[OP_ENDIF], 0), Err(ScriptError::UnbalancedConditional));
    }

    #[test]
    fn disabled_opcodes_fail_in_dead_branches() {
        assert_eq!(
            run(&[OP_0, OP_IF, OP_CAT, OP_ENDIF], 0),
            Err(ScriptError::DisabledOpcode)
        );
        // Unknown opcodes only fail when executed.
        assert!(run(&[OP_0, OP_IF, 0xba, OP_ENDIF], 0).is_ok());
        assert_eq!(run(&[0xba], 0), Err(ScriptError::BadOpcode));
    }

    #[test]
    fn minimal_data_is_policy() {
        let non_minimal = [OP_PUSHDATA1, 0x01, 0x07];
        assert!(run(&non_minimal, 0).is_ok());
        assert_eq!(
            run(&non_minimal, SCRIPT_VERIFY_MINIMALDATA),
            Err(ScriptError::MinimalData)
        );
    }

    #[test]
    fn upgradable_nops_are_discouraged_only_by_flag() {
        assert!(run(&[OP_1, OP_NOP1], 0).is_ok());
        assert_eq!(
            run(&[OP_1, OP_NOP3], SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS),
            Err(ScriptError::DiscourageUpgradableNops)
        );
    }

    #[test]
    fn multisig_consumes_dummy() {
        // 0 <sig> 1 <key> 1 CHECKMULTISIG
        let mut script = vec![OP_0, 0x01, 0xaa, OP_1, 0x01, 0xbb, OP_1, OP_CHECKMULTISIG];
        assert_eq!(run(&script, 0).expect("eval"), vec![vec![1]]);
        script[0] = OP_1;
        assert_eq!(
            run(&script, SCRIPT_VERIFY_NULLDUMMY),
            Err(ScriptError::SigNullDummy)
        );
    }

    #[test]
    fn find_and_delete_respects_boundaries() {
        let script = [0x02, 0xaa, 0xbb, OP_DUP, 0x02, 0xaa, 0xbb];
        assert_eq!(find_and_delete(&script, &[0xaa, 0xbb]), vec![OP_DUP]);
        // The pattern embedded inside another push is not removed.
        let nested = [0x03, 0x02, 0xaa, 0xbb];
        assert_eq!(find_and_delete(&nested, &[0xaa, 0xbb]), nested.to_vec());
    }

    #[test]
    fn der_encoding_rules() {
        let mut sig = vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0x01];
        assert!(is_valid_signature_encoding(&sig));
        sig[4] = 0x81;
        assert!(!is_valid_signature_encoding(&sig));
        assert!(!is_valid_signature_encoding(&[0x30]));
    }
}
