//! Local relay policy: standardness, dust and fee floors.
//!
//! None of this is consensus. A transaction refused here may still be mined.

use pivxd_chainstate::coins::Coin;
use pivxd_consensus::constants::MAX_STANDARD_TX_SIZE;
use pivxd_consensus::money::{money_range, Amount, COIN, MAX_MONEY};
use pivxd_consensus::Network;
use pivxd_primitives::encoding::Encoder;
use pivxd_primitives::transaction::{Transaction, TxOut, CURRENT_VERSION};
use pivxd_script::sigops::script_sigop_count;
use pivxd_script::standard::{
    classify_script_pubkey, is_push_only, is_unspendable, push_elements,
    script_sig_args_expected, standard_output_type, ScriptType,
};

use crate::mempool::ChainLimits;

pub const DEFAULT_MIN_RELAY_FEE_PER_KB: Amount = 10_000;
pub const DEFAULT_LIMIT_FREE_RELAY: u32 = 30;
pub const DEFAULT_MAX_MEMPOOL_BYTES: usize = 300 * 1_000_000;
pub const DEFAULT_MEMPOOL_EXPIRY_SECS: i64 = 72 * 60 * 60;
pub const DEFAULT_ANCESTOR_LIMIT: usize = 25;
pub const DEFAULT_ANCESTOR_SIZE_LIMIT: usize = 101 * 1000;
pub const DEFAULT_DESCENDANT_LIMIT: usize = 25;
pub const DEFAULT_DESCENDANT_SIZE_LIMIT: usize = 101 * 1000;
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;
pub const MAX_OP_RETURN_RELAY: usize = 83;
pub const MAX_P2SH_SIGOPS: u32 = 15;
/// Transactions below this size may relay for free when they have priority.
pub const DEFAULT_BLOCK_PRIORITY_SIZE: usize = 50_000;
/// Fee above this multiple of the relay floor is treated as a mistake.
pub const ABSURD_FEE_FACTOR: Amount = 10_000;

#[derive(Clone, Debug)]
pub struct MempoolPolicy {
    /// Apply the standardness rules; off on regtest.
    pub require_standard: bool,
    /// Admit zero-fee transactions; only regtest does.
    pub allow_zero_fee: bool,
    pub min_relay_fee_per_kb: Amount,
    pub limit_free_relay_kb_per_minute: u32,
    pub max_mempool_bytes: usize,
    pub expiry_secs: i64,
    pub chain_limits: ChainLimits,
    pub max_scriptsig_size: usize,
    pub max_op_return_bytes: usize,
    pub dust_relay_fee_per_kb: Amount,
    pub reject_absurd_fee: bool,
    /// Require fee or priority for free-allowance transactions.
    pub relay_priority: bool,
}

impl MempoolPolicy {
    pub fn for_network(network: Network) -> Self {
        let regtest = network == Network::Regtest;
        Self {
            require_standard: !regtest,
            allow_zero_fee: regtest,
            ..Self::default()
        }
    }

    /// Relay fee owed by a transaction of `size` bytes.
    pub fn min_relay_fee(&self, size: usize) -> Amount {
        fee_for_size(self.min_relay_fee_per_kb, size)
    }

    /// Fee floor for admission. Small transactions are exempt when the
    /// free allowance applies.
    pub fn required_fee(&self, size: usize, allow_free: bool) -> Amount {
        if allow_free && size < DEFAULT_BLOCK_PRIORITY_SIZE - 1000 {
            return 0;
        }
        let fee = self.min_relay_fee(size);
        if money_range(fee) {
            fee
        } else {
            MAX_MONEY
        }
    }

    pub fn dust_threshold(&self, out: &TxOut) -> Amount {
        if is_unspendable(&out.script_pubkey) {
            return 0;
        }
        let mut encoder = Encoder::with_capacity(out.script_pubkey.len() + 9);
        encoder.write_i64_le(out.value);
        encoder.write_var_bytes(&out.script_pubkey);
        let size = encoder.into_inner().len() + 148;
        3 * fee_for_size(self.dust_relay_fee_per_kb, size)
    }

    pub fn is_dust(&self, out: &TxOut) -> bool {
        out.value < self.dust_threshold(out)
    }

    /// Output and scriptSig templates accepted for relay.
    pub fn check_standard(&self, tx: &Transaction) -> Result<(), &'static str> {
        if tx.version < 1 || tx.version > CURRENT_VERSION {
            return Err("version");
        }
        if tx.serialized_size() >= MAX_STANDARD_TX_SIZE as usize {
            return Err("tx-size");
        }
        for input in &tx.vin {
            if input.script_sig.len() > self.max_scriptsig_size {
                return Err("scriptsig-size");
            }
            if !is_push_only(&input.script_sig) {
                return Err("scriptsig-not-pushonly");
            }
        }
        let mut data_outputs = 0;
        for output in &tx.vout {
            match standard_output_type(&output.script_pubkey, self.max_op_return_bytes) {
                None => return Err("scriptpubkey"),
                Some(ScriptType::NullData) => data_outputs += 1,
                Some(_) if self.is_dust(output) => return Err("dust"),
                Some(_) => {}
            }
        }
        if data_outputs > 1 {
            return Err("multi-op-return");
        }
        Ok(())
    }

    /// Spent outputs are standard templates and each scriptSig pushes
    /// exactly the arguments its template consumes.
    pub fn inputs_standard(&self, tx: &Transaction, coins: &[Coin]) -> bool {
        tx.vin.iter().zip(coins).all(|(input, coin)| {
            let script_type = classify_script_pubkey(&coin.out.script_pubkey);
            let Some(mut expected) = script_sig_args_expected(script_type) else {
                return false;
            };
            let Some(stack) = push_elements(&input.script_sig) else {
                return false;
            };
            if script_type == ScriptType::ScriptHash {
                let Some(redeem_script) = stack.last() else {
                    return false;
                };
                match script_sig_args_expected(classify_script_pubkey(redeem_script)) {
                    Some(inner) => expected += inner,
                    None => return script_sigop_count(redeem_script, true) <= MAX_P2SH_SIGOPS,
                }
            }
            stack.len() == expected
        })
    }
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        Self {
            require_standard: true,
            allow_zero_fee: false,
            min_relay_fee_per_kb: DEFAULT_MIN_RELAY_FEE_PER_KB,
            limit_free_relay_kb_per_minute: DEFAULT_LIMIT_FREE_RELAY,
            max_mempool_bytes: DEFAULT_MAX_MEMPOOL_BYTES,
            expiry_secs: DEFAULT_MEMPOOL_EXPIRY_SECS,
            chain_limits: ChainLimits {
                ancestor_count: DEFAULT_ANCESTOR_LIMIT,
                ancestor_size: DEFAULT_ANCESTOR_SIZE_LIMIT,
                descendant_count: DEFAULT_DESCENDANT_LIMIT,
                descendant_size: DEFAULT_DESCENDANT_SIZE_LIMIT,
            },
            max_scriptsig_size: MAX_STANDARD_SCRIPTSIG_SIZE,
            max_op_return_bytes: MAX_OP_RETURN_RELAY,
            dust_relay_fee_per_kb: DEFAULT_MIN_RELAY_FEE_PER_KB,
            reject_absurd_fee: true,
            relay_priority: true,
        }
    }
}

/// Fee at `per_kb` for `size` bytes, never rounding a non-zero rate to zero.
pub fn fee_for_size(per_kb: Amount, size: usize) -> Amount {
    let fee = per_kb.saturating_mul(size as Amount) / 1000;
    if fee == 0 && per_kb > 0 {
        per_kb
    } else {
        fee
    }
}

/// High enough priority to be mined for free: one coin, a day old, in a
/// 250 byte transaction.
pub fn allow_free(priority: f64) -> bool {
    priority > (COIN as f64) * 1440.0 / 250.0
}

/// Size counted for priority. Each input is allowed its outpoint and a
/// typical scriptSig for free.
pub fn modified_size(tx: &Transaction, size: usize) -> usize {
    tx.vin.iter().fold(size, |size, input| {
        let offset = 41 + input.script_sig.len().min(110);
        if size > offset {
            size - offset
        } else {
            size
        }
    })
}
