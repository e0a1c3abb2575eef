//! Applying a block's transactions to a coin view and reverting them.

use std::time::Instant;

use pivxd_consensus::constants::MAX_BLOCK_SIGOPS_CURRENT;
use pivxd_consensus::money::{money_range, Amount};
use pivxd_consensus::upgrades::UpgradeIndex;
use pivxd_consensus::{block_value, hash256_to_hex, ConsensusParams, Hash256};
use pivxd_log::Category;
use pivxd_primitives::block::Block;
use pivxd_primitives::outpoint::OutPoint;
use pivxd_primitives::transaction::Transaction;
use pivxd_script::interpreter::{
    SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_DERSIG, SCRIPT_VERIFY_P2SH,
};
use pivxd_script::sigops::{legacy_sigop_count, p2sh_sigop_count};
use pivxd_script::standard::{is_pay_to_script_hash, is_unspendable};
use pivxd_script::ScriptFlags;
use pivxd_storage::StoreError;

use crate::coins::{Coin, CoinView, CoinsViewCache};
use crate::payments::PaymentValidator;
use crate::reject::{RejectCode, Rejection, ValidationResult};
use crate::scriptcheck::{ScriptCheck, ScriptVerifier};
use crate::state::ChainStateError;
use crate::undo::{BlockUndo, CoinMetadata, InputUndo, TxUndo};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectResult {
    Ok,
    /// Rolled back, but the view did not hold exactly what the block created.
    Unclean,
    Failed,
}

/// Coins spent by a transaction, or the prevouts the view cannot supply.
#[derive(Clone, Debug)]
pub enum InputCoins {
    Found(Vec<Coin>),
    Missing(Vec<OutPoint>),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InputValues {
    pub value_in: Amount,
    /// Zero for coinstakes, whose outputs exceed their inputs.
    pub fee: Amount,
}

pub struct ConnectContext<'a> {
    pub params: &'a ConsensusParams,
    pub height: i32,
    pub check_scripts: bool,
    /// Record transactions whose scripts passed in the verifier cache.
    pub cache_scripts: bool,
    pub payments: &'a dyn PaymentValidator,
    pub scripts: &'a ScriptVerifier,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectedBlock {
    pub undo: BlockUndo,
    pub fees: Amount,
    pub mint: Amount,
    pub sigops: u32,
    pub script_checks: u64,
    pub script_cache_hits: u64,
}

/// Script flags enforced on every input of a block at `height`.
pub fn block_script_flags(height: i32, params: &ConsensusParams) -> ScriptFlags {
    let mut flags = SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_DERSIG;
    if height > 0 && params.upgrade_active(height - 1, UpgradeIndex::Bip65) {
        flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
    }
    flags
}

pub fn fetch_inputs<V: CoinView>(tx: &Transaction, view: &V) -> Result<InputCoins, StoreError> {
    let mut coins = Vec::with_capacity(tx.vin.len());
    let mut missing = Vec::new();
    for input in &tx.vin {
        match view.get(&input.prevout)? {
            Some(coin) => coins.push(coin),
            None => missing.push(input.prevout.clone()),
        }
    }
    if missing.is_empty() {
        Ok(InputCoins::Found(coins))
    } else {
        Ok(InputCoins::Missing(missing))
    }
}

/// Maturity, value range and fee rules for a transaction spending `coins`
/// in a block at `spend_height`.
pub fn check_tx_inputs(
    tx: &Transaction,
    coins: &[Coin],
    spend_height: i32,
    params: &ConsensusParams,
) -> ValidationResult<InputValues> {
    let mut value_in: Amount = 0;
    for coin in coins {
        if coin.is_reward() && spend_height - coin.height < params.coinbase_maturity {
            return Err(Rejection::invalid(
                RejectCode::Invalid,
                "bad-txns-premature-spend-of-coinbase-coinstake",
            )
            .with_debug(format!("tried to spend coin at depth {}", spend_height - coin.height)));
        }
        value_in = value_in.saturating_add(coin.out.value);
        if !money_range(coin.out.value) || !money_range(value_in) {
            return Err(Rejection::dos(
                100,
                RejectCode::Invalid,
                "bad-txns-inputvalues-outofrange",
            ));
        }
    }

    if tx.is_coinstake() {
        return Ok(InputValues { value_in, fee: 0 });
    }
    let value_out = tx.value_out().ok_or_else(|| {
        Rejection::dos(100, RejectCode::Invalid, "bad-txns-txouttotal-toolarge")
    })?;
    if value_in < value_out {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-in-belowout")
            .with_debug(format!("value in {value_in} < value out {value_out}")));
    }
    let fee = value_in - value_out;
    if fee < 0 {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-fee-negative"));
    }
    if !money_range(fee) {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-txns-fee-outofrange"));
    }
    Ok(InputValues { value_in, fee })
}

fn too_many_sigops() -> Rejection {
    Rejection::dos(100, RejectCode::Invalid, "bad-blk-sigops").with_debug("too many sigops")
}

/// Adds the spendable outputs of `tx` to the view.
pub fn add_outputs<B: CoinView>(
    view: &mut CoinsViewCache<B>,
    tx: &Transaction,
    txid: Hash256,
    height: i32,
) -> Result<(), StoreError> {
    let (is_coinbase, is_coinstake) = (tx.is_coinbase(), tx.is_coinstake());
    for (index, out) in tx.vout.iter().enumerate() {
        if is_unspendable(&out.script_pubkey) {
            continue;
        }
        view.put(
            OutPoint::new(txid, index as u32),
            Coin::new(out.clone(), height, is_coinbase, is_coinstake),
        )?;
    }
    Ok(())
}

/// Spends the inputs and creates the outputs of every transaction in
/// `block`, enforcing input, sigop, reward and script rules. On error the
/// view is left partially updated and must be discarded.
pub fn connect_transactions<B: CoinView>(
    block: &Block,
    view: &mut CoinsViewCache<B>,
    ctx: &ConnectContext<'_>,
) -> Result<ConnectedBlock, ChainStateError> {
    let params = ctx.params;
    let height = ctx.height;
    let pos_active = params.is_pos_active(height);
    if block.is_proof_of_stake() && !pos_active {
        return Err(Rejection::dos(100, RejectCode::Invalid, "PoS-early")
            .with_debug(format!("proof-of-stake block at height {height}"))
            .into());
    }
    if block.is_proof_of_work() && pos_active {
        return Err(Rejection::dos(100, RejectCode::Invalid, "PoW-ended")
            .with_debug(format!("proof-of-work block at height {height}"))
            .into());
    }

    let flags = block_script_flags(height, params);
    let inputs_start = Instant::now();
    let mut connected = ConnectedBlock {
        undo: BlockUndo {
            txs: Vec::with_capacity(block.transactions.len().saturating_sub(1)),
        },
        ..ConnectedBlock::default()
    };
    let mut checks: Vec<ScriptCheck<'_>> = Vec::new();
    let mut checked_txids: Vec<Hash256> = Vec::new();
    let mut value_in_total: Amount = 0;
    let mut value_out_total: Amount = 0;

    for tx in &block.transactions {
        let txid = tx.txid();
        connected.sigops = connected.sigops.saturating_add(legacy_sigop_count(tx));
        if connected.sigops > MAX_BLOCK_SIGOPS_CURRENT {
            return Err(too_many_sigops().into());
        }

        if !tx.is_coinbase() {
            let coins = match fetch_inputs(tx, &*view)? {
                InputCoins::Found(coins) => coins,
                InputCoins::Missing(_) => {
                    return Err(Rejection::dos(
                        100,
                        RejectCode::Invalid,
                        "bad-txns-inputs-missingorspent",
                    )
                    .with_debug(format!("tx {}", hash256_to_hex(&txid)))
                    .into());
                }
            };

            for (input, coin) in tx.vin.iter().zip(&coins) {
                if is_pay_to_script_hash(&coin.out.script_pubkey) {
                    connected.sigops = connected.sigops.saturating_add(p2sh_sigop_count(
                        &coin.out.script_pubkey,
                        &input.script_sig,
                    ));
                }
            }
            if connected.sigops > MAX_BLOCK_SIGOPS_CURRENT {
                return Err(too_many_sigops().into());
            }

            let values = check_tx_inputs(tx, &coins, height, params)
                .map_err(|err| err.with_debug(format!("tx {}", hash256_to_hex(&txid))))?;
            value_in_total = value_in_total.saturating_add(values.value_in);
            connected.fees = connected.fees.saturating_add(values.fee);

            if ctx.check_scripts {
                if ctx.scripts.cache().contains(&txid, flags) {
                    connected.script_cache_hits += 1;
                } else {
                    for (input_index, coin) in coins.iter().enumerate() {
                        checks.push(ScriptCheck {
                            tx,
                            input_index,
                            script_pubkey: coin.out.script_pubkey.clone(),
                            flags,
                        });
                    }
                    checked_txids.push(txid);
                }
            }

            let mut tx_undo = TxUndo {
                prevouts: Vec::with_capacity(tx.vin.len()),
            };
            for input in &tx.vin {
                let coin = view.remove(&input.prevout)?.ok_or_else(|| {
                    Rejection::dos(100, RejectCode::Invalid, "bad-txns-inputs-missingorspent")
                })?;
                tx_undo.prevouts.push(InputUndo::from(coin));
            }
            connected.undo.txs.push(tx_undo);
        }

        let value_out = tx.value_out().ok_or_else(|| {
            Rejection::dos(100, RejectCode::Invalid, "bad-txns-txouttotal-toolarge")
        })?;
        value_out_total = value_out_total.saturating_add(value_out);
        add_outputs(view, tx, txid, height)?;
    }
    let inputs_elapsed = inputs_start.elapsed();

    connected.mint = value_out_total - value_in_total + connected.fees;
    let mut expected = block_value(height, params) + ctx.payments.budget_amount(height);
    if block.is_proof_of_work() {
        expected += connected.fees;
    }
    if connected.mint != expected {
        return Err(Rejection::dos(100, RejectCode::Invalid, "bad-cb-amount")
            .with_debug(format!(
                "coinbase pays {} but the expected mint is {expected}",
                connected.mint
            ))
            .into());
    }
    if !ctx.payments.is_block_payee_valid(block, height) {
        return Err(Rejection::invalid(RejectCode::Invalid, "bad-cb-payee")
            .with_debug(format!("couldn't find masternode/budget payment at {height}"))
            .into());
    }

    let script_start = Instant::now();
    if !checks.is_empty() {
        ctx.scripts
            .verify(&checks)
            .map_err(|failure| {
                pivxd_log::log_warn!(
                    "script check failed for tx {} input {}: {}",
                    hash256_to_hex(&failure.txid),
                    failure.input_index,
                    failure.error
                );
                failure.to_rejection()
            })?;
        if ctx.cache_scripts {
            for txid in &checked_txids {
                ctx.scripts.cache().insert(txid, flags);
            }
        }
    }
    connected.script_checks = checks.len() as u64;
    pivxd_log::log_print!(
        Category::Bench,
        "    - connect {} txs, {} inputs: {:.2}ms inputs, {:.2}ms scripts",
        block.transactions.len(),
        checks.len(),
        inputs_elapsed.as_secs_f64() * 1000.0,
        script_start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(connected)
}

/// Restores one spent coin at `outpoint`.
pub fn apply_input_undo<B: CoinView>(
    undo: &InputUndo,
    view: &mut CoinsViewCache<B>,
    outpoint: &OutPoint,
) -> Result<DisconnectResult, StoreError> {
    let clean = !view.have_coin(outpoint)?;
    let metadata = match undo.metadata {
        Some(metadata) => metadata,
        None => match view.coins_for_txid(&outpoint.hash)?.into_iter().next() {
            Some((_, sibling)) => CoinMetadata {
                height: sibling.height,
                is_coinbase: sibling.is_coinbase,
                is_coinstake: sibling.is_coinstake,
            },
            None => return Ok(DisconnectResult::Failed),
        },
    };
    view.put(
        outpoint.clone(),
        Coin::new(
            undo.out.clone(),
            metadata.height,
            metadata.is_coinbase,
            metadata.is_coinstake,
        ),
    )?;
    Ok(if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    })
}

/// Reverts `block` (at `height`) using its undo data and rewinds the view's
/// best block to the parent.
pub fn disconnect_transactions<B: CoinView>(
    block: &Block,
    height: i32,
    undo: &BlockUndo,
    view: &mut CoinsViewCache<B>,
) -> Result<DisconnectResult, StoreError> {
    if undo.txs.len() + 1 != block.transactions.len() {
        pivxd_log::log_error!(
            "block {} and undo data are inconsistent",
            hash256_to_hex(&block.hash())
        );
        return Ok(DisconnectResult::Failed);
    }

    let mut clean = true;
    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        let (is_coinbase, is_coinstake) = (tx.is_coinbase(), tx.is_coinstake());
        for (index, out) in tx.vout.iter().enumerate() {
            if is_unspendable(&out.script_pubkey) {
                continue;
            }
            let matches = view
                .remove(&OutPoint::new(txid, index as u32))?
                .is_some_and(|coin| {
                    coin.out == *out
                        && coin.height == height
                        && coin.is_coinbase == is_coinbase
                        && coin.is_coinstake == is_coinstake
                });
            if !matches {
                clean = false;
            }
        }

        if tx_index == 0 {
            continue;
        }
        let tx_undo = &undo.txs[tx_index - 1];
        if tx_undo.prevouts.len() != tx.vin.len() {
            pivxd_log::log_error!(
                "undo data for tx {} has {} records for {} inputs",
                hash256_to_hex(&txid),
                tx_undo.prevouts.len(),
                tx.vin.len()
            );
            return Ok(DisconnectResult::Failed);
        }
        for (input, prev) in tx.vin.iter().zip(&tx_undo.prevouts).rev() {
            match apply_input_undo(prev, view, &input.prevout)? {
                DisconnectResult::Ok => {}
                DisconnectResult::Unclean => clean = false,
                DisconnectResult::Failed => return Ok(DisconnectResult::Failed),
            }
        }
    }

    view.set_best_block(block.header.prev_block);
    Ok(if clean {
        DisconnectResult::Ok
    } else {
        DisconnectResult::Unclean
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::CoinsDb;
    use crate::payments::AcceptAllPayments;
    use crate::validation::block_merkle_root;
    use pivxd_consensus::money::COIN;
    use pivxd_consensus::{consensus_params, Network};
    use pivxd_primitives::block::BlockHeader;
    use pivxd_primitives::transaction::{TxIn, TxOut, SEQUENCE_FINAL};
    use pivxd_script::opcodes::push_int;
    use pivxd_storage::memory::MemoryStore;
    use std::sync::Arc;

    const FUNDING: Hash256 = [7u8; 32];

    fn out(value: Amount) -> TxOut {
        TxOut {
            value,
            script_pubkey: vec![0x51],
        }
    }

    fn coinbase(height: i32, value: Amount) -> Transaction {
        let mut script_sig = Vec::new();
        push_int(&mut script_sig, i64::from(height));
        script_sig.push(0x00);
        Transaction {
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![out(value)],
            ..Transaction::default()
        }
    }

    fn spend(prevout: OutPoint, value: Amount) -> Transaction {
        Transaction {
            vin: vec![TxIn {
                prevout,
                script_sig: Vec::new(),
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![out(value)],
            ..Transaction::default()
        }
    }

    fn block(prev: Hash256, transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                prev_block: prev,
                bits: 0x207f_ffff,
                ..BlockHeader::default()
            },
            transactions,
            signature: Vec::new(),
        };
        block.header.merkle_root = block_merkle_root(&block).0;
        block
    }

    fn funded_view(coin_height: i32, coinbase: bool) -> CoinsViewCache<CoinsDb<Arc<MemoryStore>>> {
        let db = CoinsDb::new(Arc::new(MemoryStore::new())).expect("db");
        let mut view = CoinsViewCache::new(db);
        view.put(
            OutPoint::new(FUNDING, 0),
            Coin::new(out(10 * COIN), coin_height, coinbase, false),
        )
        .expect("put");
        view.set_best_block([1u8; 32]);
        view
    }

    fn context<'a>(
        params: &'a ConsensusParams,
        height: i32,
        scripts: &'a ScriptVerifier,
    ) -> ConnectContext<'a> {
        ConnectContext {
            params,
            height,
            check_scripts: true,
            cache_scripts: true,
            payments: &AcceptAllPayments,
            scripts,
        }
    }

    #[test]
    fn connect_then_disconnect_restores_the_view() {
        let params = consensus_params(Network::Regtest);
        let scripts = ScriptVerifier::new(1, 16).expect("verifier");
        let mut view = funded_view(3, false);
        let before: Vec<(u32, Coin)> = view.coins_for_txid(&FUNDING).expect("coins");

        let fee = COIN;
        let pay = spend(OutPoint::new(FUNDING, 0), 9 * COIN);
        let block = block(
            [1u8; 32],
            vec![coinbase(10, block_value(10, &params) + fee), pay.clone()],
        );
        let connected =
            connect_transactions(&block, &mut view, &context(&params, 10, &scripts)).expect("connect");
        assert_eq!(connected.fees, fee);
        assert_eq!(connected.script_checks, 1);
        assert!(scripts.cache().contains(&pay.txid(), block_script_flags(10, &params)));
        assert!(view.get(&OutPoint::new(FUNDING, 0)).expect("get").is_none());
        view.set_best_block(block.hash());

        let result = disconnect_transactions(&block, 10, &connected.undo, &mut view).expect("undo");
        assert_eq!(result, DisconnectResult::Ok);
        assert_eq!(view.coins_for_txid(&FUNDING).expect("coins"), before);
        assert!(view.coins_for_txid(&pay.txid()).expect("coins").is_empty());
        assert_eq!(view.best_block().expect("best"), [1u8; 32]);
    }

    #[test]
    fn reward_must_match_exactly() {
        let params = consensus_params(Network::Regtest);
        let scripts = ScriptVerifier::new(1, 0).expect("verifier");
        let reward = block_value(10, &params);
        for (paid, ok) in [(reward + 1, false), (reward - 1, false), (reward, true)] {
            let mut view = funded_view(3, false);
            let block = block([1u8; 32], vec![coinbase(10, paid)]);
            let result = connect_transactions(&block, &mut view, &context(&params, 10, &scripts));
            match result {
                Ok(_) => assert!(ok, "paid {paid} accepted"),
                Err(ChainStateError::Rejected(rejection)) => {
                    assert!(!ok);
                    assert_eq!(rejection.reason, "bad-cb-amount");
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
    }

    #[test]
    fn coinbase_maturity_boundary() {
        let params = consensus_params(Network::Regtest);
        let maturity = params.coinbase_maturity;
        let coin = Coin::new(out(COIN), 5, true, false);
        let tx = spend(OutPoint::new(FUNDING, 0), COIN);
        let early = check_tx_inputs(&tx, &[coin.clone()], 5 + maturity - 1, &params)
            .expect_err("immature");
        assert_eq!(early.reason, "bad-txns-premature-spend-of-coinbase-coinstake");
        assert_eq!(early.dos, 0);
        assert!(check_tx_inputs(&tx, &[coin], 5 + maturity, &params).is_ok());
    }

    #[test]
    fn input_value_rules() {
        let params = consensus_params(Network::Regtest);
        let coin = Coin::new(out(COIN), 1, false, false);
        let overspend = spend(OutPoint::new(FUNDING, 0), 2 * COIN);
        assert_eq!(
            check_tx_inputs(&overspend, &[coin.clone()], 200, &params)
                .expect_err("below out")
                .reason,
            "bad-txns-in-belowout"
        );
        let values = check_tx_inputs(&spend(OutPoint::new(FUNDING, 0), COIN / 2), &[coin], 200, &params)
            .expect("ok");
        assert_eq!(values, InputValues { value_in: COIN, fee: COIN / 2 });
    }

    #[test]
    fn double_spend_inside_block_is_rejected() {
        let params = consensus_params(Network::Regtest);
        let scripts = ScriptVerifier::new(1, 0).expect("verifier");
        let mut view = funded_view(3, false);
        let first = spend(OutPoint::new(FUNDING, 0), 9 * COIN);
        let mut second = first.clone();
        second.vout[0].value = 8 * COIN;
        let block = block(
            [1u8; 32],
            vec![coinbase(10, block_value(10, &params)), first, second],
        );
        match connect_transactions(&block, &mut view, &context(&params, 10, &scripts)) {
            Err(ChainStateError::Rejected(rejection)) => {
                assert_eq!(rejection.reason, "bad-txns-inputs-missingorspent")
            }
            other => panic!("unexpected {:?}", other.map(|c| c.fees)),
        }
    }

    #[test]
    fn failing_script_rejects_block() {
        let params = consensus_params(Network::Regtest);
        let scripts = ScriptVerifier::new(2, 16).expect("verifier");
        let mut view = funded_view(3, false);
        let mut pay = spend(OutPoint::new(FUNDING, 0), 10 * COIN);
        // OP_RETURN in the unlocking script fails before the locking script runs.
        pay.vin[0].script_sig = vec![0x6a];
        let block = block([1u8; 32], vec![coinbase(10, block_value(10, &params)), pay]);
        match connect_transactions(&block, &mut view, &context(&params, 10, &scripts)) {
            Err(ChainStateError::Rejected(rejection)) => {
                assert!(rejection.reason.starts_with("mandatory-script-verify-flag-failed"));
                assert_eq!(rejection.dos, 100);
            }
            other => panic!("unexpected {:?}", other.map(|c| c.fees)),
        }
    }

    #[test]
    fn missing_metadata_borrows_from_sibling() {
        let mut view = funded_view(3, true);
        let spent = OutPoint::new(FUNDING, 1);
        let undo = InputUndo {
            out: out(COIN),
            metadata: None,
        };
        assert_eq!(
            apply_input_undo(&undo, &mut view, &spent).expect("apply"),
            DisconnectResult::Ok
        );
        let restored = view.get(&spent).expect("get").expect("coin");
        assert_eq!((restored.height, restored.is_coinbase), (3, true));

        let orphan = OutPoint::new([9u8; 32], 0);
        assert_eq!(
            apply_input_undo(&undo, &mut view, &orphan).expect("apply"),
            DisconnectResult::Failed
        );
        assert_eq!(
            apply_input_undo(&undo, &mut view, &spent).expect("apply"),
            DisconnectResult::Unclean
        );
    }

    #[test]
    fn undo_count_mismatch_fails() {
        let params = consensus_params(Network::Regtest);
        let mut view = funded_view(3, false);
        let block = block([1u8; 32], vec![coinbase(10, block_value(10, &params))]);
        let bogus = BlockUndo {
            txs: vec![TxUndo::default()],
        };
        assert_eq!(
            disconnect_transactions(&block, 10, &bogus, &mut view).expect("disconnect"),
            DisconnectResult::Failed
        );
    }
}
