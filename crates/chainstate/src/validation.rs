//! Context-free and height/time-dependent block and transaction checks.

use std::collections::HashSet;

use pivxd_consensus::constants::{
    max_block_sigops, LOCKTIME_THRESHOLD, MAX_BLOCK_SIZE_CURRENT, MAX_SPECIALTX_EXTRAPAYLOAD,
    MAX_TX_SIZE,
};
use pivxd_consensus::money::{money_range, MAX_MONEY};
use pivxd_consensus::params::Network;
use pivxd_consensus::upgrades::UpgradeIndex;
use pivxd_consensus::{ConsensusParams, Hash256};
use pivxd_pow::check_proof_of_work;
use pivxd_primitives::block::{Block, BlockHeader};
use pivxd_primitives::hash::sha256d;
use pivxd_primitives::transaction::{Transaction, TX_TYPE_NORMAL};
use pivxd_script::opcodes::push_int;
use pivxd_script::sigops::legacy_sigop_count;

use crate::reject::{RejectCode, Rejection, ValidationResult};

const MIN_COINBASE_SCRIPT_LEN: usize = 2;
const MAX_COINBASE_SCRIPT_LEN: usize = 100;

#[derive(Clone, Copy, Debug)]
pub struct ValidationFlags {
    pub check_pow: bool,
    pub check_merkle: bool,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_pow: true,
            check_merkle: true,
        }
    }
}

/// Position of a new block relative to its parent and the active chain.
#[derive(Clone, Copy, Debug)]
pub struct HeaderContext {
    /// Height the new block would have.
    pub height: i32,
    pub prev_time: i64,
    pub prev_median_time_past: i64,
    pub chain_height: i32,
    pub adjusted_time: i64,
    pub max_reorg_depth: i32,
}

pub fn check_transaction(tx: &Transaction) -> ValidationResult<()> {
    if tx.vin.is_empty() {
        return Err(Rejection::dos(10, RejectCode::Invalid, "bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(Rejection::dos(10, RejectCode::Invalid, "bad-txns-vout-empty"));
    }
    if tx.serialized_size() > MAX_TX_SIZE as usize {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-oversize"));
    }

    let mut total = 0i64;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-vout-negative"));
        }
        if output.value > MAX_MONEY {
            return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-vout-toolarge"));
        }
        total += output.value;
        if !money_range(total) {
            return Err(Rejection::dos(
                100,
                RejectCode::Invalid,
                "bad-txns-txouttotal-toolarge",
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(&input.prevout) {
            return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-inputs-duplicate"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&len) {
            return Err(Rejection::dos(100, RejectCode::Invalid, "bad-cb-length")
                .with_debug(format!("scriptSig length {len}")));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(Rejection::dos(10, RejectCode::Invalid, "bad-txns-prevout-null"));
    }
    Ok(())
}

/// Version, type and payload consistency. No special transaction type is enabled yet.
pub fn check_special_tx(tx: &Transaction) -> ValidationResult<()> {
    if !tx.is_sapling_version() {
        if tx.tx_type != TX_TYPE_NORMAL {
            return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-type-version"));
        }
        return Ok(());
    }
    if tx.tx_type == TX_TYPE_NORMAL {
        if tx.has_extra_payload() {
            return Err(Rejection::dos(
                100,
                RejectCode::Invalid,
                "bad-txns-payload-unexpected",
            ));
        }
        return Ok(());
    }
    if !tx.has_extra_payload() {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-payload-empty"));
    }
    if tx.extra_payload_len() > MAX_SPECIALTX_EXTRAPAYLOAD {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-payload-oversize"));
    }
    Err(Rejection::dos(10, RejectCode::Invalid, "bad-tx-type")
        .with_debug(format!("type {}", tx.tx_type)))
}

pub fn check_block_header(
    header: &BlockHeader,
    params: &ConsensusParams,
    check_pow: bool,
) -> ValidationResult<()> {
    if check_pow && check_proof_of_work(&header.hash(), header.bits, params).is_err() {
        return Err(Rejection::dos(50, RejectCode::Invalid, "high-hash")
            .with_debug("proof of work failed"));
    }
    if params.network == Network::Regtest {
        return Ok(());
    }
    let zerocoin = params.zerocoin_active_at_time(i64::from(header.time));
    if zerocoin != (header.version >= 4) {
        return Err(Rejection::dos(50, RejectCode::Invalid, "block-version")
            .with_debug(format!("version {} at time {}", header.version, header.time)));
    }
    Ok(())
}

/// Structural block check. Returns the transaction ids on success.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    flags: ValidationFlags,
) -> ValidationResult<Vec<Hash256>> {
    check_block_header(
        &block.header,
        params,
        flags.check_pow && block.is_proof_of_work(),
    )?;

    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    if flags.check_merkle {
        let (root, mutated) = merkle_root(&txids);
        if root != block.header.merkle_root {
            return Err(Rejection::corrupt(100, RejectCode::Invalid, "bad-txnmrklroot")
                .with_debug("hashMerkleRoot mismatch"));
        }
        if mutated {
            return Err(Rejection::corrupt(100, RejectCode::Invalid, "bad-txns-duplicate")
                .with_debug("duplicate transaction"));
        }
    }

    let max_size = MAX_BLOCK_SIZE_CURRENT as usize;
    if block.transactions.is_empty()
        || block.transactions.len() > max_size
        || block.serialized_size() > max_size
    {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-blk-length")
            .with_debug("size limits failed"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-cb-missing")
            .with_debug("first tx is not coinbase"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-cb-multiple")
            .with_debug("more than one coinbase"));
    }

    if block.is_proof_of_stake() {
        let coinbase = &block.transactions[0];
        if coinbase.vout.len() != 1 || !coinbase.vout[0].is_empty() {
            return Err(Rejection::dos(100, RejectCode::Invalid, "bad-cb-pos")
                .with_debug("coinbase output not empty for proof-of-stake block"));
        }
        if block.transactions[2..].iter().any(Transaction::is_coinstake) {
            return Err(Rejection::dos(100, RejectCode::Invalid, "bad-cs-multiple")
                .with_debug("more than one coinstake"));
        }
    }

    let mut seen = HashSet::with_capacity(txids.len());
    let mut sigops = 0u32;
    for (tx, txid) in block.transactions.iter().zip(&txids) {
        if !seen.insert(txid) {
            return Err(Rejection::corrupt(100, RejectCode::Invalid, "bad-txns-duplicate")
                .with_debug("duplicate transaction"));
        }
        check_special_tx(tx)?;
        check_transaction(tx)?;
        sigops = sigops.saturating_add(legacy_sigop_count(tx));
    }
    let max_sigops = max_block_sigops(params.zerocoin_active_at_time(i64::from(block.header.time)));
    if sigops > max_sigops {
        return Err(Rejection::corrupt(100, RejectCode::Invalid, "bad-blk-sigops")
            .with_debug("out-of-bounds SigOpCount"));
    }
    Ok(txids)
}

/// Timestamp rules relative to the parent and the adjusted clock.
pub fn check_block_time(
    header: &BlockHeader,
    ctx: &HeaderContext,
    params: &ConsensusParams,
) -> ValidationResult<()> {
    let time = i64::from(header.time);
    if !params.is_valid_block_timestamp(time, ctx.height) {
        return Err(Rejection::dos(100, RejectCode::Invalid, "invalid-time-mask")
            .with_debug(format!("block time {time} not on a slot boundary")));
    }
    let min_past = if params.is_time_protocol_v2(ctx.height) {
        ctx.prev_time
    } else {
        ctx.prev_median_time_past
    };
    if time <= min_past {
        return Err(Rejection::dos(50, RejectCode::Invalid, "time-too-old")
            .with_debug(format!("block time {time} <= {min_past}")));
    }
    let max_future = ctx.adjusted_time + params.future_block_time_drift(ctx.height);
    if time > max_future {
        return Err(Rejection::invalid(RejectCode::Invalid, "time-too-new")
            .with_debug(format!("block time {time} > {max_future}")));
    }
    Ok(())
}

pub fn contextual_check_block_header(
    header: &BlockHeader,
    hash: &Hash256,
    ctx: &HeaderContext,
    params: &ConsensusParams,
) -> ValidationResult<()> {
    let height = ctx.height;
    if ctx.chain_height - height >= ctx.max_reorg_depth {
        return Err(Rejection::dos(1, RejectCode::Invalid, "bad-fork-prior-to-maxreorg")
            .with_debug(format!("fork at height {height}, tip at {}", ctx.chain_height)));
    }
    if !params.skip_time_checks {
        check_block_time(header, ctx, params)?;
    }
    if let Some(checkpoint) = params.checkpoint_at(height) {
        if &checkpoint.hash != hash {
            return Err(Rejection::dos(100, RejectCode::Checkpoint, "checkpoint mismatch")
                .with_debug(format!("rejected by checkpoint lock-in at {height}")));
        }
    }
    if height < params.last_checkpoint_height() {
        return Err(Rejection::invalid(
            RejectCode::Checkpoint,
            "bad-fork-prior-to-checkpoint",
        ));
    }
    if header.version < minimum_block_version(height, params) {
        return Err(Rejection::invalid(RejectCode::Obsolete, "bad-version")
            .with_debug(format!("rejected nVersion={} block", header.version)));
    }
    Ok(())
}

/// Lowest header version accepted at `height` given the active upgrades.
pub fn minimum_block_version(height: i32, params: &ConsensusParams) -> i32 {
    const RULES: [(UpgradeIndex, i32); 4] = [
        (UpgradeIndex::V4_0, 7),
        (UpgradeIndex::V3_4, 6),
        (UpgradeIndex::Bip65, 5),
        (UpgradeIndex::Zc, 4),
    ];
    for (upgrade, version) in RULES {
        if params.upgrade_active(height, upgrade) {
            return version;
        }
    }
    if height >= 1 {
        3
    } else {
        0
    }
}

pub fn contextual_check_block(block: &Block, height: i32) -> ValidationResult<()> {
    let block_time = i64::from(block.header.time);
    for tx in &block.transactions {
        if !is_final_tx(tx, height, block_time) {
            return Err(Rejection::dos(10, RejectCode::Invalid, "bad-txns-nonfinal")
                .with_debug("contains a non-final transaction"));
        }
    }
    if height > 0 && !coinbase_height_matches(&block.transactions[0], height) {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-cb-height")
            .with_debug("block height mismatch in coinbase"));
    }
    Ok(())
}

pub fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = i64::from(tx.lock_time);
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        block_time
    };
    if lock_time < cutoff {
        return true;
    }
    tx.vin.iter().all(|input| input.is_final())
}

pub fn coinbase_height_matches(tx: &Transaction, height: i32) -> bool {
    let Some(input) = tx.vin.first() else {
        return false;
    };
    let mut expected = Vec::with_capacity(6);
    push_int(&mut expected, i64::from(height));
    input.script_sig.starts_with(&expected)
}

pub fn block_merkle_root(block: &Block) -> (Hash256, bool) {
    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    merkle_root(&txids)
}

/// Merkle root over `txids` and whether the last pair of some level was a
/// duplicate, the malleation that lets two transaction lists share a root.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        for pair in (0..size).step_by(2) {
            let right = (pair + 1).min(size - 1);
            if right == pair + 1 && right + 1 == size && layer[pair] == layer[right] {
                mutated = true;
            }
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(&layer[pair]);
            data[32..].copy_from_slice(&layer[right]);
            next.push(sha256d(&data));
        }
        layer = next;
    }
    (layer[0], mutated)
}
