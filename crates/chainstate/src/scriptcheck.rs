//! Parallel input-script verification with a verified-transaction cache.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use pivxd_consensus::Hash256;
use pivxd_primitives::transaction::Transaction;
use pivxd_script::{verify_script, ScriptError, ScriptFlags, TransactionSignatureChecker};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use sha2::{Digest, Sha256};

use crate::reject::{RejectCode, Rejection};

pub const DEFAULT_SCRIPT_CACHE_ENTRIES: usize = 50_000;

/// One input to verify: the spending transaction, the input position and
/// the locking script of the coin it spends.
#[derive(Clone, Debug)]
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub flags: ScriptFlags,
}

impl ScriptCheck<'_> {
    pub fn verify(&self) -> Result<(), ScriptError> {
        let input = &self.tx.vin[self.input_index];
        let checker = TransactionSignatureChecker::new(self.tx, self.input_index);
        verify_script(&input.script_sig, &self.script_pubkey, self.flags, &checker)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScriptFailure {
    pub txid: Hash256,
    pub input_index: usize,
    pub error: ScriptError,
}

impl ScriptFailure {
    pub fn to_rejection(&self) -> Rejection {
        Rejection::dos(
            100,
            RejectCode::Invalid,
            format!("mandatory-script-verify-flag-failed ({})", self.error),
        )
        .with_debug(format!("input {}", self.input_index))
    }
}

/// Transactions whose scripts all passed under a given flag set.
pub struct ScriptCache {
    capacity: usize,
    inner: Mutex<ScriptCacheInner>,
}

#[derive(Default)]
struct ScriptCacheInner {
    keys: HashSet<Hash256>,
    order: VecDeque<Hash256>,
}

fn cache_key(txid: &Hash256, flags: ScriptFlags) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(txid);
    hasher.update(flags.to_le_bytes());
    hasher.finalize().into()
}

impl ScriptCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(ScriptCacheInner::default()),
        }
    }

    pub fn contains(&self, txid: &Hash256, flags: ScriptFlags) -> bool {
        let key = cache_key(txid, flags);
        self.inner
            .lock()
            .map(|inner| inner.keys.contains(&key))
            .unwrap_or(false)
    }

    pub fn insert(&self, txid: &Hash256, flags: ScriptFlags) {
        if self.capacity == 0 {
            return;
        }
        let key = cache_key(txid, flags);
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if !inner.keys.insert(key) {
            return;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.keys.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs batches of [`ScriptCheck`]s on a bounded pool. With one thread the
/// batch runs on the caller.
pub struct ScriptVerifier {
    pool: Option<ThreadPool>,
    cache: ScriptCache,
}

impl ScriptVerifier {
    pub fn new(threads: usize, cache_entries: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = if threads > 1 {
            Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("scriptch.{index}"))
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self {
            pool,
            cache: ScriptCache::new(cache_entries),
        })
    }

    pub fn cache(&self) -> &ScriptCache {
        &self.cache
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or(1, ThreadPool::current_num_threads)
    }

    /// Verifies every check. Returns once all passed or the first failure is seen.
    pub fn verify(&self, checks: &[ScriptCheck<'_>]) -> Result<(), ScriptFailure> {
        let run_one = |check: &ScriptCheck<'_>| {
            check.verify().map_err(|error| ScriptFailure {
                txid: check.tx.txid(),
                input_index: check.input_index,
                error,
            })
        };
        match &self.pool {
            Some(pool) if checks.len() > 1 => {
                pool.install(|| checks.par_iter().try_for_each(run_one))
            }
            _ => checks.iter().try_for_each(run_one),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivxd_primitives::outpoint::OutPoint;
    use pivxd_primitives::transaction::{TxIn, TxOut, SEQUENCE_FINAL};
    use pivxd_script::interpreter::SCRIPT_VERIFY_P2SH;

    fn spend(script_sig: Vec<u8>) -> Transaction {
        Transaction {
            vin: vec![TxIn {
                prevout: OutPoint::new([3u8; 32], 0),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            ..Transaction::default()
        }
    }

    #[test]
    fn first_failure_fails_the_batch() {
        let verifier = ScriptVerifier::new(2, 16).expect("pool");
        assert_eq!(verifier.threads(), 2);
        let good = spend(vec![0x51]);
        let bad = spend(vec![0x00]);
        let checks: Vec<ScriptCheck<'_>> = (0..8)
            .map(|n| ScriptCheck {
                tx: if n == 5 { &bad } else { &good },
                input_index: 0,
                // OP_NOP leaves the pushed value as the result.
                script_pubkey: vec![0x61],
                flags: SCRIPT_VERIFY_P2SH,
            })
            .collect();
        let failure = verifier.verify(&checks).expect_err("one input fails");
        assert_eq!(failure.txid, bad.txid());
        assert_eq!(failure.error, ScriptError::EvalFalse);
        assert!(failure
            .to_rejection()
            .reason
            .starts_with("mandatory-script-verify-flag-failed ("));

        assert!(verifier.verify(&checks[..5]).is_ok());
    }

    #[test]
    fn cache_is_keyed_by_flags_and_bounded() {
        let cache = ScriptCache::new(2);
        cache.insert(&[1u8; 32], 1);
        assert!(cache.contains(&[1u8; 32], 1));
        assert!(!cache.contains(&[1u8; 32], 5));
        cache.insert(&[2u8; 32], 1);
        cache.insert(&[3u8; 32], 1);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&[1u8; 32], 1));
        assert!(cache.contains(&[3u8; 32], 1));
    }
}
