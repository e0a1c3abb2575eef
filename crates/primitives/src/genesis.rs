//! Genesis block assembly from network parameters.

use pivxd_consensus::params::GenesisParams;
use pivxd_consensus::ConsensusParams;

use crate::block::{Block, BlockHeader};
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};

const OP_PUSHDATA1: u8 = 0x4c;
const OP_CHECKSIG: u8 = 0xac;

/// Builds the genesis block; its hash is whatever this block hashes to.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    let genesis = &params.genesis;
    let coinbase = genesis_coinbase(genesis);
    let merkle_root = coinbase.txid();
    Block {
        header: BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root,
            time: genesis.time,
            bits: genesis.bits,
            nonce: genesis.nonce,
            ..BlockHeader::default()
        },
        transactions: vec![coinbase],
        signature: Vec::new(),
    }
}

fn genesis_coinbase(genesis: &GenesisParams) -> Transaction {
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04];
    push_data(&mut script_sig, genesis.coinbase_message.as_bytes());

    let pubkey = decode_hex(genesis.output_pubkey).expect("genesis output pubkey");
    let mut script_pubkey = Vec::with_capacity(pubkey.len() + 2);
    push_data(&mut script_pubkey, &pubkey);
    script_pubkey.push(OP_CHECKSIG);

    Transaction {
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value: genesis.reward,
            script_pubkey,
        }],
        ..Transaction::default()
    }
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    if data.len() < OP_PUSHDATA1 as usize {
        script.push(data.len() as u8);
    } else {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
    }
    script.extend_from_slice(data);
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivxd_consensus::{consensus_params, Network};

    #[test]
    fn genesis_commits_to_its_coinbase() {
        let params = consensus_params(Network::Mainnet);
        let block = genesis_block(&params);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.header.merkle_root, block.transactions[0].txid());
        assert_eq!(block.transactions[0].vout[0].value, params.genesis.reward);
        assert_eq!(block.transactions[0].vout[0].script_pubkey.len(), 67);
    }

    #[test]
    fn networks_differ_in_genesis() {
        let main = genesis_block(&consensus_params(Network::Mainnet)).hash();
        let test = genesis_block(&consensus_params(Network::Testnet)).hash();
        let reg = genesis_block(&consensus_params(Network::Regtest)).hash();
        assert_ne!(main, test);
        assert_ne!(main, reg);
    }
}
