//! Chain state and mempool behind one handle.
//!
//! Locks are always taken chain first, then mempool. Chain events are drained
//! after every chain operation and replayed into the mempool before the chain
//! lock is released, so readers never see a mempool built on a stale tip.

use std::sync::{Mutex, MutexGuard};

use pivxd_chainstate::coins::{CoinsDb, CoinsViewCache};
use pivxd_chainstate::flush::FlushMode;
use pivxd_chainstate::{BlockStatus, ChainEvent, ChainState, ChainStateError, TipInfo};
use pivxd_consensus::{hash256_to_hex, Hash256};
use pivxd_log::Category;
use pivxd_primitives::block::Block;
use pivxd_primitives::transaction::Transaction;
use pivxd_storage::KeyValueStore;

use crate::admission::{AcceptOptions, Admission, FreeRelayLimiter};
use crate::mempool::{Mempool, MempoolError, MempoolErrorKind};
use crate::policy::MempoolPolicy;

pub struct ValidationContext<S: KeyValueStore + Clone> {
    chain: Mutex<ChainState<S>>,
    mempool: Mutex<Mempool>,
    limiter: Mutex<FreeRelayLimiter>,
    policy: MempoolPolicy,
}

/// What a mempool sync did after a chain change.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MempoolSync {
    pub confirmed: usize,
    pub conflicts: usize,
    pub resurrected: usize,
    pub dropped: usize,
}

impl<S: KeyValueStore + Clone> ValidationContext<S> {
    pub fn new(chain: ChainState<S>, policy: MempoolPolicy) -> Self {
        Self {
            chain: Mutex::new(chain),
            mempool: Mutex::new(Mempool::new()),
            limiter: Mutex::new(FreeRelayLimiter::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &MempoolPolicy {
        &self.policy
    }

    /// Validates and stores `block`, activating the best chain and
    /// updating the mempool for every block connected or disconnected.
    pub fn process_block(&self, block: &Block) -> Result<BlockStatus, ChainStateError> {
        self.with_chain_events(|chain| chain.process_new_block(block))
    }

    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        self.with_chain_events(|chain| chain.invalidate_block(hash))
    }

    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), ChainStateError> {
        self.with_chain_events(|chain| chain.reconsider_block(hash))
    }

    pub fn flush(&self, mode: FlushMode) -> Result<(), ChainStateError> {
        self.lock_chain()?.flush_state_to_disk(mode)
    }

    /// Runs `tx` through admission against the current tip.
    pub fn submit_transaction(
        &self,
        tx: &Transaction,
        options: AcceptOptions,
    ) -> Result<Hash256, MempoolError> {
        let chain = self
            .chain
            .lock()
            .map_err(|_| MempoolError::internal("chain lock poisoned"))?;
        let mut pool = self
            .mempool
            .lock()
            .map_err(|_| MempoolError::internal("mempool lock poisoned"))?;
        let mut limiter = self
            .limiter
            .lock()
            .map_err(|_| MempoolError::internal("limiter lock poisoned"))?;
        let admission = admission_at(&chain, &self.policy);
        admission.accept(&mut pool, &mut limiter, tx, options)
    }

    pub fn tip(&self) -> Option<TipInfo> {
        self.chain.lock().ok().and_then(|chain| chain.tip())
    }

    /// Borrows the chain state for reads. Holding it blocks block processing.
    pub fn with_chain<T>(&self, f: impl FnOnce(&ChainState<S>) -> T) -> Result<T, ChainStateError> {
        let chain = self.lock_chain()?;
        Ok(f(&chain))
    }

    /// Borrows the mempool without touching the chain lock.
    pub fn with_mempool<T>(&self, f: impl FnOnce(&Mempool) -> T) -> Option<T> {
        self.mempool.lock().ok().map(|pool| f(&pool))
    }

    fn lock_chain(&self) -> Result<MutexGuard<'_, ChainState<S>>, ChainStateError> {
        self.chain
            .lock()
            .map_err(|_| ChainStateError::Aborted("chain lock poisoned".to_string()))
    }

    fn with_chain_events<T>(
        &self,
        op: impl FnOnce(&mut ChainState<S>) -> Result<T, ChainStateError>,
    ) -> Result<T, ChainStateError> {
        let mut chain = self.lock_chain()?;
        let result = op(&mut chain);
        let events = chain.take_events();
        if !events.is_empty() {
            let sync = self.sync_mempool(&chain, events)?;
            pivxd_log::log_print!(Category::Mempool, "mempool sync: {sync:?}");
        }
        result
    }

    fn sync_mempool(
        &self,
        chain: &ChainState<S>,
        events: Vec<ChainEvent>,
    ) -> Result<MempoolSync, ChainStateError> {
        let mut pool = self
            .mempool
            .lock()
            .map_err(|_| ChainStateError::Aborted("mempool lock poisoned".to_string()))?;
        let mut limiter = self
            .limiter
            .lock()
            .map_err(|_| ChainStateError::Aborted("limiter lock poisoned".to_string()))?;
        let mut sync = MempoolSync::default();

        let mut disconnected = Vec::new();
        for event in events {
            match event {
                ChainEvent::BlockConnected { block, .. } => {
                    let removal = pool.remove_for_block(&block.transactions);
                    sync.confirmed += removal.confirmed.len();
                    sync.conflicts += removal.conflicts.len();
                }
                ChainEvent::BlockDisconnected { block, height } => {
                    disconnected.push((height, block));
                }
            }
        }
        if disconnected.is_empty() {
            return Ok(sync);
        }

        disconnected.sort_by_key(|(height, _)| *height);
        let admission = admission_at(chain, &self.policy);
        for (_, block) in &disconnected {
            for tx in &block.transactions {
                if tx.is_coinbase() || tx.is_coinstake() {
                    continue;
                }
                match admission.accept(&mut pool, &mut limiter, tx, AcceptOptions::resurrect()) {
                    Ok(_) => sync.resurrected += 1,
                    Err(err) => {
                        pivxd_log::log_print!(
                            Category::Mempool,
                            "dropped disconnected tx {}: {err}",
                            hash256_to_hex(&tx.txid())
                        );
                        if !matches!(
                            err.kind,
                            MempoolErrorKind::AlreadyInMempool | MempoolErrorKind::AlreadyKnown
                        ) {
                            sync.dropped += pool.remove_spends_of(tx).len();
                        }
                    }
                }
            }
        }

        if let Some(tip) = chain.tip() {
            let removed = pool.remove_for_reorg(
                chain.coins(),
                tip.height + 1,
                tip.median_time_past,
                chain.params().coinbase_maturity,
            )?;
            sync.dropped += removed.len();
        }
        let expiry_cutoff = chain.adjusted_time() - self.policy.expiry_secs;
        sync.dropped += pool
            .limit_size(self.policy.max_mempool_bytes, expiry_cutoff)
            .len();
        if sync.dropped > 0 {
            pivxd_log::log_warn!(
                "mempool lost {} transactions after reorganization",
                sync.dropped
            );
        }
        Ok(sync)
    }
}

fn admission_at<'a, S: KeyValueStore + Clone>(
    chain: &'a ChainState<S>,
    policy: &'a MempoolPolicy,
) -> Admission<'a, CoinsViewCache<CoinsDb<S>>> {
    let (height, median_time_past) = chain
        .tip()
        .map(|tip| (tip.height, tip.median_time_past))
        .unwrap_or((-1, 0));
    Admission {
        params: chain.params(),
        coins: chain.coins(),
        scripts: chain.script_verifier(),
        policy,
        height,
        median_time_past,
        now: chain.adjusted_time(),
    }
}
