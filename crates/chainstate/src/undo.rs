//! Per-block reverse deltas used to disconnect a block.

use pivxd_consensus::Hash256;
use pivxd_primitives::encoding::{DecodeError, Decoder, Encoder};
use pivxd_primitives::hash::sha256d;
use pivxd_primitives::transaction::TxOut;

use crate::coins::Coin;

const BLOCK_UNDO_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoinMetadata {
    pub height: i32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
}

/// A spent output. Records without metadata borrow it from a still-unspent
/// sibling output of the same transaction when they are restored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InputUndo {
    pub out: TxOut,
    pub metadata: Option<CoinMetadata>,
}

impl From<Coin> for InputUndo {
    fn from(coin: Coin) -> Self {
        Self {
            metadata: Some(CoinMetadata {
                height: coin.height,
                is_coinbase: coin.is_coinbase,
                is_coinstake: coin.is_coinstake,
            }),
            out: coin.out,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub prevouts: Vec<InputUndo>,
}

/// Undo data for every non-coinbase transaction of a block, in block order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

#[derive(Debug)]
pub enum UndoError {
    Decode(DecodeError),
    ChecksumMismatch,
}

impl std::fmt::Display for UndoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UndoError::Decode(err) => write!(f, "undo decode failed: {err}"),
            UndoError::ChecksumMismatch => write!(f, "undo checksum mismatch"),
        }
    }
}

impl std::error::Error for UndoError {}

impl From<DecodeError> for UndoError {
    fn from(err: DecodeError) -> Self {
        UndoError::Decode(err)
    }
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.txs.len() as u64);
        for tx in &self.txs {
            encoder.write_varint(tx.prevouts.len() as u64);
            for input in &tx.prevouts {
                encoder.write_i64_le(input.out.value);
                encoder.write_var_bytes(&input.out.script_pubkey);
                match input.metadata {
                    Some(meta) => {
                        encoder.write_bool(true);
                        encoder.write_i32_le(meta.height);
                        encoder.write_bool(meta.is_coinbase);
                        encoder.write_bool(meta.is_coinstake);
                    }
                    None => encoder.write_bool(false),
                }
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let tx_count = decoder.read_varint()? as usize;
        if tx_count > decoder.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let mut txs = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            let input_count = decoder.read_varint()? as usize;
            if input_count > decoder.remaining() {
                return Err(DecodeError::UnexpectedEof);
            }
            let mut prevouts = Vec::with_capacity(input_count);
            for _ in 0..input_count {
                let value = decoder.read_i64_le()?;
                let script_pubkey = decoder.read_var_bytes()?;
                let metadata = if decoder.read_bool()? {
                    Some(CoinMetadata {
                        height: decoder.read_i32_le()?,
                        is_coinbase: decoder.read_bool()?,
                        is_coinstake: decoder.read_bool()?,
                    })
                } else {
                    None
                };
                prevouts.push(InputUndo {
                    out: TxOut {
                        value,
                        script_pubkey,
                    },
                    metadata,
                });
            }
            txs.push(TxUndo { prevouts });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txs })
    }

    /// Serialized undo followed by a checksum binding it to the parent block.
    pub fn encode_with_checksum(&self, prev_hash: &Hash256) -> Vec<u8> {
        let mut bytes = self.encode();
        let checksum = undo_checksum(prev_hash, &bytes);
        bytes.extend_from_slice(&checksum);
        bytes
    }

    pub fn decode_with_checksum(bytes: &[u8], prev_hash: &Hash256) -> Result<Self, UndoError> {
        if bytes.len() < CHECKSUM_LEN {
            return Err(UndoError::Decode(DecodeError::UnexpectedEof));
        }
        let (payload, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if undo_checksum(prev_hash, payload).as_slice() != checksum {
            return Err(UndoError::ChecksumMismatch);
        }
        Ok(Self::decode(payload)?)
    }
}

pub fn undo_checksum(prev_hash: &Hash256, payload: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(32 + payload.len());
    data.extend_from_slice(prev_hash);
    data.extend_from_slice(payload);
    sha256d(&data)
}
