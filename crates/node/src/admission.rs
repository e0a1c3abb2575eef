//! Mempool admission: the ordered policy and consensus gate a loose
//! transaction passes before it is stored.

use std::sync::Arc;

use pivxd_chainstate::coins::{Coin, CoinView};
use pivxd_chainstate::connect::{block_script_flags, check_tx_inputs};
use pivxd_chainstate::scriptcheck::{ScriptCheck, ScriptVerifier};
use pivxd_chainstate::validation::{check_special_tx, check_transaction, is_final_tx};
use pivxd_chainstate::RejectCode;
use pivxd_consensus::constants::MAX_TX_SIGOPS_CURRENT;
use pivxd_consensus::money::Amount;
use pivxd_consensus::upgrades::UpgradeIndex;
use pivxd_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use pivxd_log::Category;
use pivxd_primitives::outpoint::OutPoint;
use pivxd_primitives::transaction::Transaction;
use pivxd_script::interpreter::{
    ScriptFlags, MANDATORY_SCRIPT_VERIFY_FLAGS, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY,
    STANDARD_SCRIPT_VERIFY_FLAGS,
};
use pivxd_script::sigops::{legacy_sigop_count, p2sh_sigop_count};
use pivxd_script::standard::is_pay_to_script_hash;

use crate::mempool::{Mempool, MempoolEntry, MempoolError, MempoolErrorKind, MEMPOOL_HEIGHT};
use crate::policy::{allow_free, modified_size, MempoolPolicy, ABSURD_FEE_FACTOR};

/// Decay window of the free relay limiter, in seconds.
const FREE_RELAY_WINDOW_SECS: f64 = 600.0;

#[derive(Clone, Copy, Debug)]
pub struct AcceptOptions {
    /// Enforce the relay fee floor and the free-transaction rate limit.
    pub limit_free: bool,
    /// Skip expiry and trimming after insertion.
    pub bypass_limits: bool,
    pub reject_absurd_fee: bool,
}

impl AcceptOptions {
    /// Used for transactions returned from disconnected blocks.
    pub fn resurrect() -> Self {
        Self {
            limit_free: false,
            bypass_limits: true,
            reject_absurd_fee: false,
        }
    }
}

impl Default for AcceptOptions {
    fn default() -> Self {
        Self {
            limit_free: true,
            bypass_limits: false,
            reject_absurd_fee: true,
        }
    }
}

/// Exponentially decaying count of free transaction bytes.
#[derive(Clone, Debug, Default)]
pub struct FreeRelayLimiter {
    count: f64,
    last_time: i64,
}

impl FreeRelayLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charges `size` bytes at `now` unless the window already holds
    /// `limit_kb_per_minute` worth of free traffic.
    pub fn allow(&mut self, now: i64, size: usize, limit_kb_per_minute: u32) -> bool {
        let elapsed = now.saturating_sub(self.last_time).max(0) as f64;
        self.count *= (1.0 - 1.0 / FREE_RELAY_WINDOW_SECS).powf(elapsed);
        self.last_time = now;
        if self.count >= f64::from(limit_kb_per_minute) * 10.0 * 1000.0 {
            return false;
        }
        pivxd_log::log_trace!(
            "free relay count {:.0} => {:.0}",
            self.count,
            self.count + size as f64
        );
        self.count += size as f64;
        true
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

/// Chain position and collaborators a transaction is admitted against.
pub struct Admission<'a, V> {
    pub params: &'a ConsensusParams,
    pub coins: &'a V,
    pub scripts: &'a ScriptVerifier,
    pub policy: &'a MempoolPolicy,
    /// Active chain height; the transaction is judged for the next block.
    pub height: i32,
    pub median_time_past: i64,
    pub now: i64,
}

impl<V: CoinView> Admission<'_, V> {
    /// Runs every admission rule on `tx` and inserts it into `pool`.
    pub fn accept(
        &self,
        pool: &mut Mempool,
        limiter: &mut FreeRelayLimiter,
        tx: &Transaction,
        options: AcceptOptions,
    ) -> Result<Hash256, MempoolError> {
        let txid = tx.txid();
        match self.try_accept(pool, limiter, tx, txid, options) {
            Ok(()) => {
                pivxd_log::log_print!(
                    Category::Mempool,
                    "accepted {} (pool size {} txn, {} kB)",
                    hash256_to_hex(&txid),
                    pool.size(),
                    pool.bytes() / 1000
                );
                Ok(txid)
            }
            Err(err) => {
                if !err.is_orphan() {
                    pivxd_log::log_print!(
                        Category::MempoolRej,
                        "{} from mempool rejected: {err}",
                        hash256_to_hex(&txid)
                    );
                }
                Err(err)
            }
        }
    }

    fn try_accept(
        &self,
        pool: &mut Mempool,
        limiter: &mut FreeRelayLimiter,
        tx: &Transaction,
        txid: Hash256,
        options: AcceptOptions,
    ) -> Result<(), MempoolError> {
        check_special_tx(tx).map_err(MempoolError::invalid)?;
        check_transaction(tx).map_err(MempoolError::invalid)?;
        if tx.is_coinbase() {
            return Err(invalid(100, "coinbase"));
        }
        if tx.is_coinstake() {
            return Err(invalid(100, "coinstake"));
        }
        let next_height = self.height + 1;
        if !is_final_tx(tx, next_height, self.median_time_past) {
            return Err(nonstandard("non-final"));
        }
        if self.policy.require_standard {
            if let Err(reason) = self.policy.check_standard(tx) {
                return Err(nonstandard(reason));
            }
        }
        if pool.contains(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                RejectCode::Duplicate,
                "txn-already-in-mempool",
            ));
        }
        for input in &tx.vin {
            if let Some(spender) = pool.spender(&input.prevout) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    RejectCode::Duplicate,
                    "txn-mempool-conflict",
                )
                .with_debug(format!("input already spent by {}", hash256_to_hex(&spender))));
            }
        }
        if !self.coins.coins_for_txid(&txid)?.is_empty() {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyKnown,
                RejectCode::Duplicate,
                "txn-already-known",
            ));
        }

        let (coins, parents) = self.resolve_inputs(pool, tx)?;
        if self.policy.require_standard && !self.policy.inputs_standard(tx, &coins) {
            return Err(nonstandard("bad-txns-nonstandard-inputs"));
        }
        let sigops = legacy_sigop_count(tx)
            + tx
                .vin
                .iter()
                .zip(&coins)
                .filter(|(_, coin)| is_pay_to_script_hash(&coin.out.script_pubkey))
                .map(|(input, coin)| p2sh_sigop_count(&coin.out.script_pubkey, &input.script_sig))
                .sum::<u32>();
        if sigops > MAX_TX_SIGOPS_CURRENT {
            return Err(nonstandard("bad-txns-too-many-sigops")
                .with_debug(format!("{sigops} > {MAX_TX_SIGOPS_CURRENT}")));
        }
        let values = check_tx_inputs(tx, &coins, next_height, self.params)
            .map_err(MempoolError::invalid)?;
        let fee = values.fee;

        let entry = self.build_entry(tx, txid, &coins, parents, fee, sigops);
        let size = entry.size;
        let min_relay_fee = self.policy.min_relay_fee(size);
        let required = self.policy.required_fee(size, true);
        if options.limit_free && fee < required {
            return Err(fee_rejection("insufficient fee").with_debug(format!("{fee} < {required}")));
        }
        if self.policy.relay_priority
            && fee < min_relay_fee
            && !allow_free(entry.priority_at(next_height))
        {
            return Err(fee_rejection("insufficient priority"));
        }
        if options.limit_free
            && fee < min_relay_fee
            && !limiter.allow(self.now, size, self.policy.limit_free_relay_kb_per_minute)
        {
            return Err(fee_rejection("rate limited free transaction"));
        }
        let absurd = min_relay_fee.saturating_mul(ABSURD_FEE_FACTOR);
        if options.reject_absurd_fee && fee > absurd {
            return Err(MempoolError::new(
                MempoolErrorKind::AbsurdFee,
                RejectCode::Nonstandard,
                "absurdly-high-fee",
            )
            .with_debug(format!("{fee} > {absurd}")));
        }
        if fee == 0 && !self.policy.allow_zero_fee {
            return Err(fee_rejection("insufficient fee").with_debug("zero fee not accepted"));
        }

        pool.ancestors(&entry.parents, size, &self.policy.chain_limits)
            .map_err(|message| {
                MempoolError::new(
                    MempoolErrorKind::TooLongChain,
                    RejectCode::Nonstandard,
                    "too-long-mempool-chain",
                )
                .with_debug(message)
            })?;

        self.check_scripts(tx, txid, &coins)?;

        pool.insert(entry)?;
        if !options.bypass_limits {
            let expiry_cutoff = self.now - self.policy.expiry_secs;
            pool.limit_size(self.policy.max_mempool_bytes, expiry_cutoff);
            if !pool.contains(&txid) {
                return Err(MempoolError::new(
                    MempoolErrorKind::MempoolFull,
                    RejectCode::InsufficientFee,
                    "mempool full",
                ));
            }
        }
        Ok(())
    }

    /// Coins spent by `tx`, from the pool first and then the chain view,
    /// along with the in-pool parents.
    fn resolve_inputs(
        &self,
        pool: &Mempool,
        tx: &Transaction,
    ) -> Result<(Vec<Coin>, Vec<Hash256>), MempoolError> {
        let mut coins = Vec::with_capacity(tx.vin.len());
        let mut parents: Vec<Hash256> = Vec::new();
        let mut missing: Vec<OutPoint> = Vec::new();
        for input in &tx.vin {
            if let Some(out) = pool.output(&input.prevout) {
                coins.push(Coin::new(out, MEMPOOL_HEIGHT, false, false));
                if !parents.contains(&input.prevout.hash) {
                    parents.push(input.prevout.hash);
                }
                continue;
            }
            match self.coins.get(&input.prevout)? {
                Some(coin) => coins.push(coin),
                None => missing.push(input.prevout.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(MempoolError::missing_inputs(missing));
        }
        Ok((coins, parents))
    }

    fn build_entry(
        &self,
        tx: &Transaction,
        txid: Hash256,
        coins: &[Coin],
        parents: Vec<Hash256>,
        fee: Amount,
        sigops: u32,
    ) -> MempoolEntry {
        let size = tx.serialized_size();
        let modified_size = modified_size(tx, size);
        let mut coin_age = 0f64;
        let mut in_chain_value: Amount = 0;
        for coin in coins.iter().filter(|coin| coin.height <= self.height) {
            coin_age += coin.out.value as f64 * f64::from(self.height - coin.height);
            in_chain_value = in_chain_value.saturating_add(coin.out.value);
        }
        let priority = if modified_size == 0 {
            0.0
        } else {
            coin_age / modified_size as f64
        };
        MempoolEntry {
            txid,
            tx: Arc::new(tx.clone()),
            size,
            modified_size,
            fee,
            time: self.now,
            height: self.height,
            priority,
            in_chain_value,
            sigops,
            parents,
        }
    }

    /// Standard flags first, then the mandatory subset. Passing the first
    /// and failing the second is an internal error.
    fn check_scripts(
        &self,
        tx: &Transaction,
        txid: Hash256,
        coins: &[Coin],
    ) -> Result<(), MempoolError> {
        let mut extra: ScriptFlags = 0;
        if self.params.upgrade_active(self.height, UpgradeIndex::Bip65) {
            extra |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
        }
        let standard = STANDARD_SCRIPT_VERIFY_FLAGS | extra;
        let mandatory = MANDATORY_SCRIPT_VERIFY_FLAGS | extra;
        if let Err(failure) = self.scripts.verify(&script_checks(tx, coins, standard)) {
            return Err(match self.scripts.verify(&script_checks(tx, coins, mandatory)) {
                Err(failure) => MempoolError::invalid(failure.to_rejection()),
                Ok(()) => nonstandard(format!(
                    "non-mandatory-script-verify-flag ({})",
                    failure.error
                )),
            });
        }
        if let Err(failure) = self.scripts.verify(&script_checks(tx, coins, mandatory)) {
            pivxd_log::log_error!(
                "transaction {} passed standard script flags but failed mandatory ones: {}",
                hash256_to_hex(&txid),
                failure.to_rejection()
            );
            return Err(MempoolError::internal("script flag mismatch"));
        }
        // Standard flags cover the block flags, so the block check can be skipped later.
        let block_flags = block_script_flags(self.height + 1, self.params);
        self.scripts.cache().insert(&txid, block_flags);
        Ok(())
    }
}

fn script_checks<'a>(tx: &'a Transaction, coins: &[Coin], flags: ScriptFlags) -> Vec<ScriptCheck<'a>> {
    coins
        .iter()
        .enumerate()
        .map(|(input_index, coin)| ScriptCheck {
            tx,
            input_index,
            script_pubkey: coin.out.script_pubkey.clone(),
            flags,
        })
        .collect()
}

fn invalid(dos: u32, reason: &str) -> MempoolError {
    MempoolError::invalid(pivxd_chainstate::Rejection::dos(
        dos,
        RejectCode::Invalid,
        reason,
    ))
}

fn nonstandard(reason: impl Into<String>) -> MempoolError {
    MempoolError::new(MempoolErrorKind::NonStandard, RejectCode::Nonstandard, reason)
}

fn fee_rejection(reason: &str) -> MempoolError {
    MempoolError::new(
        MempoolErrorKind::InsufficientFee,
        RejectCode::InsufficientFee,
        reason,
    )
}
