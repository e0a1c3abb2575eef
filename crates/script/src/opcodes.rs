//! Opcode table and a bounds-checked instruction reader.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_RESERVED: u8 = 0x50;
pub const OP_1: u8 = 0x51;
pub const OP_2: u8 = 0x52;
pub const OP_16: u8 = 0x60;

pub const OP_NOP: u8 = 0x61;
pub const OP_VER: u8 = 0x62;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_VERIF: u8 = 0x65;
pub const OP_VERNOTIF: u8 = 0x66;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;

pub const OP_TOALTSTACK: u8 = 0x6b;
pub const OP_FROMALTSTACK: u8 = 0x6c;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_2DUP: u8 = 0x6e;
pub const OP_3DUP: u8 = 0x6f;
pub const OP_2OVER: u8 = 0x70;
pub const OP_2ROT: u8 = 0x71;
pub const OP_2SWAP: u8 = 0x72;
pub const OP_IFDUP: u8 = 0x73;
pub const OP_DEPTH: u8 = 0x74;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_NIP: u8 = 0x77;
pub const OP_OVER: u8 = 0x78;
pub const OP_PICK: u8 = 0x79;
pub const OP_ROLL: u8 = 0x7a;
pub const OP_ROT: u8 = 0x7b;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_TUCK: u8 = 0x7d;

pub const OP_CAT: u8 = 0x7e;
pub const OP_SUBSTR: u8 = 0x7f;
pub const OP_LEFT: u8 = 0x80;
pub const OP_RIGHT: u8 = 0x81;
pub const OP_SIZE: u8 = 0x82;

pub const OP_INVERT: u8 = 0x83;
pub const OP_AND: u8 = 0x84;
pub const OP_OR: u8 = 0x85;
pub const OP_XOR: u8 = 0x86;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;

pub const OP_1ADD: u8 = 0x8b;
pub const OP_1SUB: u8 = 0x8c;
pub const OP_2MUL: u8 = 0x8d;
pub const OP_2DIV: u8 = 0x8e;
pub const OP_NEGATE: u8 = 0x8f;
pub const OP_ABS: u8 = 0x90;
pub const OP_NOT: u8 = 0x91;
pub const OP_0NOTEQUAL: u8 = 0x92;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
pub const OP_MUL: u8 = 0x95;
pub const OP_DIV: u8 = 0x96;
pub const OP_MOD: u8 = 0x97;
pub const OP_LSHIFT: u8 = 0x98;
pub const OP_RSHIFT: u8 = 0x99;
pub const OP_BOOLAND: u8 = 0x9a;
pub const OP_BOOLOR: u8 = 0x9b;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
pub const OP_NUMNOTEQUAL: u8 = 0x9e;
pub const OP_LESSTHAN: u8 = 0x9f;
pub const OP_GREATERTHAN: u8 = 0xa0;
pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
pub const OP_MIN: u8 = 0xa3;
pub const OP_MAX: u8 = 0xa4;
pub const OP_WITHIN: u8 = 0xa5;

pub const OP_RIPEMD160: u8 = 0xa6;
pub const OP_SHA1: u8 = 0xa7;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

pub const OP_NOP1: u8 = 0xb0;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
pub const OP_NOP3: u8 = 0xb2;
pub const OP_NOP10: u8 = 0xb9;

/// Opcodes that fail the script even inside an unexecuted branch.
pub fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_CAT
            | OP_SUBSTR
            | OP_LEFT
            | OP_RIGHT
            | OP_INVERT
            | OP_AND
            | OP_OR
            | OP_XOR
            | OP_2MUL
            | OP_2DIV
            | OP_MUL
            | OP_DIV
            | OP_MOD
            | OP_LSHIFT
            | OP_RSHIFT
    )
}

/// Small-integer value of `OP_0`/`OP_1`..`OP_16`.
pub fn decode_small_int(opcode: u8) -> Option<u8> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(opcode - OP_1 + 1),
        _ => None,
    }
}

pub fn encode_small_int(value: u8) -> u8 {
    if value == 0 {
        OP_0
    } else {
        OP_1 + value - 1
    }
}

/// Appends the minimal push of `data` to `script`.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        len @ 0..=0x4b => script.push(len as u8),
        len @ 0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len @ 0x100..=0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

/// Appends a script-number push of `value`.
pub fn push_int(script: &mut Vec<u8>, value: i64) {
    match value {
        0 => script.push(OP_0),
        -1 => script.push(OP_1NEGATE),
        1..=16 => script.push(OP_1 + value as u8 - 1),
        _ => push_data(script, &crate::interpreter::encode_num(value)),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: &'a [u8],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TruncatedScript;

pub struct Instructions<'a> {
    script: &'a [u8],
    cursor: usize,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self { script, cursor: 0 }
    }

    /// Byte offset of the next instruction.
    pub fn position(&self) -> usize {
        self.cursor
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], TruncatedScript> {
        let end = self.cursor.checked_add(len).ok_or(TruncatedScript)?;
        let bytes = self.script.get(self.cursor..end).ok_or(TruncatedScript)?;
        self.cursor = end;
        Ok(bytes)
    }

    fn read_len(&mut self, width: usize) -> Result<usize, TruncatedScript> {
        let bytes = self.take(width)?;
        let mut buf = [0u8; 4];
        buf[..width].copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf) as usize)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, TruncatedScript>;

    fn next(&mut self) -> Option<Self::Item> {
        let opcode = *self.script.get(self.cursor)?;
        self.cursor += 1;
        let len = match opcode {
            0x01..=0x4b => Ok(opcode as usize),
            OP_PUSHDATA1 => self.read_len(1),
            OP_PUSHDATA2 => self.read_len(2),
            OP_PUSHDATA4 => self.read_len(4),
            _ => Ok(0),
        };
        let item = len
            .and_then(|len| self.take(len))
            .map(|data| Instruction { opcode, data });
        if item.is_err() {
            self.cursor = self.script.len();
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_data_picks_minimal_opcode() {
        for (len, prefix) in [(0usize, 0u8), (75, 75), (76, OP_PUSHDATA1), (300, OP_PUSHDATA2)] {
            let mut script = Vec::new();
            push_data(&mut script, &vec![7u8; len]);
            assert_eq!(script[0], prefix);
            let parsed: Vec<_> = Instructions::new(&script).collect();
            assert_eq!(parsed.len(), 1);
            assert_eq!(parsed[0].expect("instruction").data.len(), len);
        }
    }

    #[test]
    fn truncated_push_is_reported_once() {
        let script = [OP_DUP, 0x05, 0x01];
        let mut iter = Instructions::new(&script);
        assert!(iter.next().expect("dup").is_ok());
        assert_eq!(iter.next(), Some(Err(TruncatedScript)));
        assert_eq!(iter.next(), None);
    }
}
