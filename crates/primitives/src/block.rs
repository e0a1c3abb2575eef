//! Block header and block types.

use pivxd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::{Transaction, TransactionDecodeError};

pub const CURRENT_VERSION: i32 = 10;

/// Header versions carrying the zerocoin accumulator checkpoint.
const ACCUMULATOR_VERSIONS: std::ops::Range<i32> = 4..7;
/// First header version committing to the sapling tree root.
const SAPLING_ROOT_VERSION: i32 = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub accumulator_checkpoint: Hash256,
    pub final_sapling_root: Hash256,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0,
            nonce: 0,
            accumulator_checkpoint: [0u8; 32],
            final_sapling_root: [0u8; 32],
        }
    }
}

impl BlockHeader {
    pub fn has_accumulator_checkpoint(&self) -> bool {
        ACCUMULATOR_VERSIONS.contains(&self.version)
    }

    pub fn has_sapling_root(&self) -> bool {
        self.version >= SAPLING_ROOT_VERSION
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(144);
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        if self.has_accumulator_checkpoint() {
            encoder.write_hash_le(&self.accumulator_checkpoint);
        }
        if self.has_sapling_root() {
            encoder.write_hash_le(&self.final_sapling_root);
        }
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::consensus_decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let mut header = BlockHeader {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
            ..BlockHeader::default()
        };
        if header.has_accumulator_checkpoint() {
            header.accumulator_checkpoint = decoder.read_hash_le()?;
        }
        if header.has_sapling_root() {
            header.final_sapling_root = decoder.read_hash_le()?;
        }
        Ok(header)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Staker signature; serialized only for proof-of-stake blocks.
    pub signature: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(256);
        self.header.encode_into(&mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder);
        }
        if self.is_proof_of_stake() {
            encoder.write_var_bytes(&self.signature);
        }
        encoder.into_inner()
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode().len()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let count = usize::try_from(decoder.read_varint()?).map_err(|_| DecodeError::SizeTooLarge)?;
        if count > decoder.remaining() {
            return Err(DecodeError::UnexpectedEof.into());
        }
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut decoder)?);
        }
        let mut block = Block {
            header,
            transactions,
            signature: Vec::new(),
        };
        if block.is_proof_of_stake() {
            block.signature = decoder.read_var_bytes()?;
        }
        if !decoder.is_empty() {
            return Err(BlockDecodeError::Decode(DecodeError::TrailingBytes));
        }
        Ok(block)
    }
}

#[derive(Debug)]
pub enum BlockDecodeError {
    Decode(DecodeError),
    Transaction(TransactionDecodeError),
}

impl From<DecodeError> for BlockDecodeError {
    fn from(error: DecodeError) -> Self {
        BlockDecodeError::Decode(error)
    }
}

impl From<TransactionDecodeError> for BlockDecodeError {
    fn from(error: TransactionDecodeError) -> Self {
        BlockDecodeError::Transaction(error)
    }
}

impl std::fmt::Display for BlockDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDecodeError::Decode(error) => write!(f, "{error}"),
            BlockDecodeError::Transaction(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for BlockDecodeError {}
