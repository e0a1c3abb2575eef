#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use pivxd::context::ValidationContext;
use pivxd::policy::MempoolPolicy;
use pivxd_chainstate::validation::block_merkle_root;
use pivxd_chainstate::{ChainState, ChainStateConfig};
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

pub type TestContext = ValidationContext<Arc<MemoryStore>>;

pub fn open_context(dir: &Path, policy: MempoolPolicy) -> TestContext {
    let config = ChainStateConfig {
        script_threads: 1,
        check_block_index: true,
        ..ChainStateConfig::default()
    };
    let chain = ChainState::open(
        consensus_params(Network::Regtest),
        config,
        Arc::new(MemoryStore::new()),
        dir,
    )
    .expect("open chain state");
    ValidationContext::new(chain, policy)
}

pub fn regtest_policy() -> MempoolPolicy {
    MempoolPolicy::for_network(Network::Regtest)
}

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

    /// Block paying the exact reward plus `fees` to `OP_1`.
    pub fn next_block(&self, parent: &Tip, tag: u8, txs: Vec<Transaction>, fees: Amount) -> Block {
        let value = self.reward(parent.height + 1) + fees;
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
        let mut script_sig = Vec::new();
        push_int(&mut script_sig, i64::from(parent.height + 1));
        script_sig.push(tag);
        let coinbase = Transaction {
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
        };
        let mut transactions = vec![coinbase];
        transactions.extend(txs);
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

    /// Block 1 pays its reward to the test key; empty blocks follow up to
    /// `height`. Returns block 1 and the tip.
    pub fn funded_chain(&self, ctx: &TestContext, height: i32) -> (Block, Tip) {
        let (_, pubkey) = key();
        let first = self.block_paying(&self.genesis(), 1, self.reward(1), p2pkh(&pubkey), Vec::new());
        ctx.process_block(&first).expect("block 1");
        let mut tip = Tip::of(&first, 1);
        for _ in 1..height {
            let block = self.next_block(&tip, 1, Vec::new(), 0);
            ctx.process_block(&block).expect("block accepted");
            tip = Tip::of(&block, tip.height + 1);
        }
        (first, tip)
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

/// Spends output 0 of block 1's coinbase into `outputs`, signed with the test key.
pub fn spend_funding(first: &Block, outputs: Vec<TxOut>) -> Transaction {
    let (secret, pubkey) = key();
    let mut tx = Transaction {
        vin: vec![TxIn {
            prevout: OutPoint::new(first.transactions[0].txid(), 0),
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }],
        vout: outputs,
        ..Transaction::default()
    };
    let script_pubkey = p2pkh(&pubkey);
    let secp = Secp256k1::new();
    let digest = signature_hash(&tx, 0, &script_pubkey, SighashType(SIGHASH_ALL));
    let signature = secp.sign_ecdsa(&Message::from_digest(digest), &secret);
    let mut der = signature.serialize_der().to_vec();
    der.push(SIGHASH_ALL as u8);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &der);
    push_data(&mut script_sig, &pubkey);
    tx.vin[0].script_sig = script_sig;
    tx
}

/// Single-output spend of block 1's coinbase to the test key, leaving `fee`.
pub fn pay_to_key(first: &Block, reward: Amount, fee: Amount) -> Transaction {
    let (_, pubkey) = key();
    spend_funding(
        first,
        vec![TxOut {
            value: reward - fee,
            script_pubkey: p2pkh(&pubkey),
        }],
    )
}

/// Spends an `OP_1` output.
pub fn spend_op_true(prevout: OutPoint, value: Amount) -> Transaction {
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

/// Spends block 1's coinbase into a single `OP_1` output, leaving `fee`.
pub fn pay_to_op_true(first: &Block, reward: Amount, fee: Amount) -> Transaction {
    spend_funding(
        first,
        vec![TxOut {
            value: reward - fee,
            script_pubkey: vec![OP_1],
        }],
    )
}
