#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use pivxd_chainstate::state::{ChainState, ChainStateConfig};
use pivxd_chainstate::validation::block_merkle_root;
use pivxd_consensus::money::Amount;
use pivxd_consensus::{block_value, consensus_params, ConsensusParams, Hash256, Network};
use pivxd_pow::check_proof_of_work;
use pivxd_primitives::block::{Block, BlockHeader};
use pivxd_primitives::genesis_block;
use pivxd_primitives::hash::hash160;
use pivxd_primitives::outpoint::OutPoint;
use pivxd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
use pivxd_script::opcodes::{
    push_data, push_int, OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160, OP_1,
};
use pivxd_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
use pivxd_storage::memory::MemoryStore;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

pub type TestChain = ChainState<Arc<MemoryStore>>;

pub fn open_chain(dir: &Path, store: &Arc<MemoryStore>) -> TestChain {
    let config = ChainStateConfig {
        script_threads: 1,
        check_block_index: true,
        ..ChainStateConfig::default()
    };
    ChainState::open(
        consensus_params(Network::Regtest),
        config,
        Arc::clone(store),
        dir,
    )
    .expect("open chain state")
}

/// Parent position a new block is mined on.
#[derive(Clone, Copy, Debug)]
pub struct Tip {
    pub hash: Hash256,
    pub height: i32,
    pub time: u32,
    pub bits: u32,
}

impl Tip {
    pub fn of(block: &Block, height: i32) -> Self {
        Self {
            hash: block.hash(),
            height,
            time: block.header.time,
            bits: block.header.bits,
        }
    }
}

pub struct ChainBuilder {
    pub params: ConsensusParams,
}

impl ChainBuilder {
    pub fn regtest() -> Self {
        Self {
            params: consensus_params(Network::Regtest),
        }
    }

    pub fn genesis(&self) -> Tip {
        Tip::of(&genesis_block(&self.params), 0)
    }

    pub fn reward(&self, height: i32) -> Amount {
        block_value(height, &self.params)
    }

    /// A proof-of-work block paying the exact reward plus `fees` to
    /// `OP_1`. `tag` keeps sibling coinbases distinct.
    pub fn next_block(&self, parent: &Tip, tag: u8, txs: Vec<Transaction>, fees: Amount) -> Block {
        let height = parent.height + 1;
        let value = self.reward(height) + fees;
        self.block_paying(parent, tag, value, vec![OP_1], txs)
    }

    pub fn block_paying(
        &self,
        parent: &Tip,
        tag: u8,
        value: Amount,
        script_pubkey: Vec<u8>,
        txs: Vec<Transaction>,
    ) -> Block {
        let mut transactions = vec![coinbase(parent.height + 1, tag, value, script_pubkey)];
        transactions.extend(txs);
        self.mine(parent, transactions)
    }

    pub fn mine(&self, parent: &Tip, transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                prev_block: parent.hash,
                time: parent.time + 60,
                bits: parent.bits,
                ..BlockHeader::default()
            },
            transactions,
            signature: Vec::new(),
        };
        block.header.merkle_root = block_merkle_root(&block).0;
        while check_proof_of_work(&block.header.hash(), block.header.bits, &self.params).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    /// Mines `count` empty blocks on `parent`, submitting each to `chain`.
    pub fn extend(&self, chain: &mut TestChain, parent: Tip, count: usize, tag: u8) -> Vec<Block> {
        let mut tip = parent;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let block = self.next_block(&tip, tag, Vec::new(), 0);
            chain.process_new_block(&block).expect("block accepted");
            tip = Tip::of(&block, tip.height + 1);
            blocks.push(block);
        }
        blocks
    }
}

pub fn coinbase(height: i32, tag: u8, value: Amount, script_pubkey: Vec<u8>) -> Transaction {
    let mut script_sig = Vec::new();
    push_int(&mut script_sig, i64::from(height));
    script_sig.push(tag);
    Transaction {
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey,
        }],
        ..Transaction::default()
    }
}

/// Spends `prevout` (locked by `OP_1`) into one `OP_1` output.
pub fn spend(prevout: OutPoint, value: Amount) -> Transaction {
    Transaction {
        vin: vec![TxIn {
            prevout,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![OP_1],
        }],
        ..Transaction::default()
    }
}

pub fn key() -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[0x42; 32]).expect("secret key");
    let public = PublicKey::from_secret_key(&secp, &secret);
    (secret, public.serialize().to_vec())
}

pub fn p2pkh(pubkey: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160, 0x14];
    script.extend_from_slice(&hash160(pubkey));
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

/// Signs input 0 of `tx`, which spends an output locked by `script_pubkey`.
pub fn sign_p2pkh(tx: &mut Transaction, script_pubkey: &[u8], secret: &SecretKey, pubkey: &[u8]) {
    let secp = Secp256k1::new();
    let digest = signature_hash(tx, 0, script_pubkey, SighashType(SIGHASH_ALL));
    let signature = secp.sign_ecdsa(&Message::from_digest(digest), secret);
    let mut der = signature.serialize_der().to_vec();
    der.push(SIGHASH_ALL as u8);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &der);
    push_data(&mut script_sig, pubkey);
    tx.vin[0].script_sig = script_sig;
}
