//! Transaction types and serialization.

use pivxd_consensus::money::{money_range, Amount};
use pivxd_consensus::Hash256;

use crate::encoding::{decode_vec, encode_vec, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const STANDARD_VERSION: i16 = 1;
/// Versions at or above this carry the optional shielded section and special payloads.
pub const SAPLING_VERSION: i16 = 2;
pub const CURRENT_VERSION: i16 = STANDARD_VERSION;

pub const TX_TYPE_NORMAL: i16 = 0;
pub const TX_TYPE_PROVIDER_REGISTER: i16 = 1;

pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn is_final(&self) -> bool {
        self.sequence == SEQUENCE_FINAL
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// The zero-value, scriptless output used as the coinstake marker.
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

/// A transparent transaction. The shielded section of sapling-version
/// transactions is not modelled; such transactions serialize it as absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i16,
    pub tx_type: i16,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
    pub extra_payload: Option<Vec<u8>>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            tx_type: TX_TYPE_NORMAL,
            vin: Vec::new(),
            vout: Vec::new(),
            lock_time: 0,
            extra_payload: None,
        }
    }
}

impl Transaction {
    pub fn is_null(&self) -> bool {
        self.vin.is_empty() && self.vout.is_empty()
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn is_coinstake(&self) -> bool {
        if self.vin.is_empty() || self.vin[0].prevout.is_null() {
            return false;
        }
        self.vout.len() >= 2 && self.vout[0].is_empty()
    }

    pub fn is_sapling_version(&self) -> bool {
        self.version >= SAPLING_VERSION
    }

    pub fn is_special(&self) -> bool {
        self.is_sapling_version() && self.tx_type != TX_TYPE_NORMAL
    }

    pub fn has_extra_payload(&self) -> bool {
        self.extra_payload
            .as_ref()
            .is_some_and(|payload| !payload.is_empty())
    }

    pub fn extra_payload_len(&self) -> usize {
        self.extra_payload.as_ref().map_or(0, Vec::len)
    }

    /// Sum of output values, or `None` if any value or the running total leaves the money range.
    pub fn value_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            if !money_range(output.value) {
                return None;
            }
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(128);
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i16_le(self.version);
        encoder.write_i16_le(self.tx_type);
        encode_vec(encoder, &self.vin);
        encode_vec(encoder, &self.vout);
        encoder.write_u32_le(self.lock_time);
        if self.is_sapling_version() {
            // Shielded section: always absent.
            encoder.write_bool(false);
            if self.tx_type != TX_TYPE_NORMAL {
                match &self.extra_payload {
                    Some(payload) => {
                        encoder.write_bool(true);
                        encoder.write_var_bytes(payload);
                    }
                    None => encoder.write_bool(false),
                }
            }
        }
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode().len()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, TransactionDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes.into());
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, TransactionDecodeError> {
        let version = decoder.read_i16_le()?;
        let tx_type = decoder.read_i16_le()?;
        let vin = decode_vec::<TxIn>(decoder)?;
        let vout = decode_vec::<TxOut>(decoder)?;
        let lock_time = decoder.read_u32_le()?;
        let mut extra_payload = None;
        if version >= SAPLING_VERSION {
            if decoder.read_bool()? {
                return Err(TransactionDecodeError::UnsupportedShieldedData);
            }
            if tx_type != TX_TYPE_NORMAL && decoder.read_bool()? {
                extra_payload = Some(decoder.read_var_bytes()?);
            }
        }
        Ok(Self {
            version,
            tx_type,
            vin,
            vout,
            lock_time,
            extra_payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionDecodeError {
    Decode(DecodeError),
    UnsupportedShieldedData,
}

impl From<DecodeError> for TransactionDecodeError {
    fn from(err: DecodeError) -> Self {
        TransactionDecodeError::Decode(err)
    }
}

impl std::fmt::Display for TransactionDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionDecodeError::Decode(err) => write!(f, "{err}"),
            TransactionDecodeError::UnsupportedShieldedData => {
                write!(f, "shielded transaction data is not supported")
            }
        }
    }
}

impl std::error::Error for TransactionDecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(hash_byte: u8, index: u32) -> TxIn {
        TxIn {
            prevout: OutPoint {
                hash: [hash_byte; 32],
                index,
            },
            script_sig: vec![0x51],
            sequence: SEQUENCE_FINAL,
        }
    }

    #[test]
    fn coinstake_shape() {
        let mut tx = Transaction {
            vin: vec![spend(1, 0)],
            vout: vec![
                TxOut::empty(),
                TxOut {
                    value: 10,
                    script_pubkey: vec![0x51],
                },
            ],
            ..Transaction::default()
        };
        assert!(tx.is_coinstake());
        assert!(!tx.is_coinbase());

        tx.vout[0].value = 1;
        assert!(!tx.is_coinstake());
    }

    #[test]
    fn coinbase_shape() {
        let tx = Transaction {
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x01],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut::empty()],
            ..Transaction::default()
        };
        assert!(tx.is_coinbase());
        assert!(!tx.is_coinstake());
    }

    #[test]
    fn special_payload_survives_encoding() {
        let tx = Transaction {
            version: SAPLING_VERSION,
            tx_type: TX_TYPE_PROVIDER_REGISTER,
            vin: vec![spend(2, 1)],
            vout: vec![TxOut {
                value: 5,
                script_pubkey: vec![0x51],
            }],
            lock_time: 7,
            extra_payload: Some(vec![1, 2, 3]),
        };
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert!(decoded.is_special());
        assert_eq!(decoded.extra_payload_len(), 3);
    }

    #[test]
    fn legacy_version_has_no_trailer() {
        let tx = Transaction {
            vin: vec![spend(3, 0)],
            vout: vec![TxOut::empty()],
            ..Transaction::default()
        };
        let bytes = tx.consensus_encode();
        // version(2) + type(2) + vin + vout + locktime(4)
        assert_eq!(bytes.len(), 4 + 1 + 42 + 1 + 9 + 4);
    }

    #[test]
    fn value_out_rejects_overflow() {
        let tx = Transaction {
            vout: vec![
                TxOut {
                    value: pivxd_consensus::money::MAX_MONEY,
                    script_pubkey: Vec::new(),
                },
                TxOut {
                    value: 1,
                    script_pubkey: Vec::new(),
                },
            ],
            ..Transaction::default()
        };
        assert_eq!(tx.value_out(), None);
    }
}
