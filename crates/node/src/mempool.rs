//! The transaction memory pool: entries, the spent-outpoint index and the
//! in-pool parent/child graph.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use pivxd_chainstate::coins::CoinView;
use pivxd_chainstate::validation::is_final_tx;
use pivxd_chainstate::{RejectCode, Rejection};
use pivxd_consensus::money::Amount;
use pivxd_consensus::{hash256_to_hex, Hash256};
use pivxd_log::Category;
use pivxd_primitives::outpoint::OutPoint;
use pivxd_primitives::transaction::{Transaction, TxOut};
use pivxd_storage::StoreError;

/// Height recorded for coins that only exist in the pool.
pub const MEMPOOL_HEIGHT: i32 = 0x7fff_ffff;
const MAX_PRIORITY: f64 = 1e16;
/// Bookkeeping bytes charged per entry on top of the serialized size.
const ENTRY_OVERHEAD: usize = 256;
const INPUT_OVERHEAD: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    AlreadyKnown,
    ConflictingInput,
    MissingInputs,
    /// Breaks a consensus rule; carries the rule's DoS score.
    Invalid,
    NonStandard,
    InsufficientFee,
    TooLongChain,
    MempoolFull,
    AbsurdFee,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub rejection: Rejection,
    pub missing_inputs: Vec<OutPoint>,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            kind,
            rejection: Rejection::invalid(code, reason),
            missing_inputs: Vec::new(),
        }
    }

    pub fn invalid(rejection: Rejection) -> Self {
        Self {
            kind: MempoolErrorKind::Invalid,
            rejection,
            missing_inputs: Vec::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(MempoolErrorKind::Internal, RejectCode::Invalid, message)
    }

    pub fn missing_inputs(missing_inputs: Vec<OutPoint>) -> Self {
        Self {
            kind: MempoolErrorKind::MissingInputs,
            rejection: Rejection::invalid(RejectCode::Invalid, "missing-inputs"),
            missing_inputs,
        }
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.rejection.debug = Some(debug.into());
        self
    }

    pub fn reason(&self) -> &str {
        &self.rejection.reason
    }

    /// Missing inputs may resolve once the parents arrive.
    pub fn is_orphan(&self) -> bool {
        self.kind == MempoolErrorKind::MissingInputs
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.rejection)
    }
}

impl std::error::Error for MempoolError {}

impl From<StoreError> for MempoolError {
    fn from(err: StoreError) -> Self {
        Self::internal(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Arc<Transaction>,
    pub size: usize,
    /// Size used for priority, with per-input scriptSig allowance removed.
    pub modified_size: usize,
    pub fee: Amount,
    pub time: i64,
    /// Chain height when the entry was accepted.
    pub height: i32,
    pub priority: f64,
    /// Value of the inputs that were already confirmed at entry.
    pub in_chain_value: Amount,
    pub sigops: u32,
    pub parents: Vec<Hash256>,
}

impl MempoolEntry {
    /// Priority once the chain reaches `height`; confirmed inputs keep aging.
    pub fn priority_at(&self, height: i32) -> f64 {
        if self.modified_size == 0 {
            return self.priority;
        }
        let delta = height.saturating_sub(self.height).max(0) as f64;
        let aged = delta * (self.in_chain_value.max(0) as f64) / (self.modified_size as f64);
        (self.priority + aged).min(MAX_PRIORITY)
    }

    fn usage(&self) -> usize {
        self.size + ENTRY_OVERHEAD + INPUT_OVERHEAD * self.tx.vin.len()
    }
}

/// Count and size ceilings on in-pool ancestor and descendant sets.
#[derive(Clone, Copy, Debug)]
pub struct ChainLimits {
    pub ancestor_count: usize,
    pub ancestor_size: usize,
    pub descendant_count: usize,
    pub descendant_size: usize,
}

/// Transactions dropped by [`Mempool::remove_for_block`].
#[derive(Clone, Debug, Default)]
pub struct BlockRemoval {
    pub confirmed: Vec<Hash256>,
    pub conflicts: Vec<Hash256>,
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    children: HashMap<Hash256, Vec<Hash256>>,
    total_bytes: usize,
    usage: usize,
    revision: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut out: Vec<_> = self.entries.keys().copied().collect();
        out.sort();
        out
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    /// Output `outpoint` of a pool transaction.
    pub fn output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        let entry = self.entries.get(&outpoint.hash)?;
        let index = usize::try_from(outpoint.index).ok()?;
        entry.tx.vout.get(index).cloned()
    }

    pub fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        tx.vin
            .iter()
            .all(|input| !self.entries.contains_key(&input.prevout.hash))
    }

    /// In-pool ancestors of a transaction with `parents` and `size`,
    /// enforcing `limits` on the ancestor set and every ancestor's
    /// descendant set.
    pub fn ancestors(
        &self,
        parents: &[Hash256],
        size: usize,
        limits: &ChainLimits,
    ) -> Result<HashSet<Hash256>, String> {
        let mut ancestors = HashSet::new();
        let mut queue: VecDeque<Hash256> = parents.iter().copied().collect();
        let mut ancestor_size = size;
        while let Some(txid) = queue.pop_front() {
            if !ancestors.insert(txid) {
                continue;
            }
            let Some(entry) = self.entries.get(&txid) else {
                continue;
            };
            ancestor_size += entry.size;
            if ancestors.len() + 1 > limits.ancestor_count {
                return Err(format!(
                    "too many unconfirmed ancestors [limit: {}]",
                    limits.ancestor_count
                ));
            }
            if ancestor_size > limits.ancestor_size {
                return Err(format!(
                    "exceeds ancestor size limit [limit: {}]",
                    limits.ancestor_size
                ));
            }
            let descendants = self.descendants(&txid);
            let descendant_size: usize = descendants
                .iter()
                .filter_map(|id| self.entries.get(id))
                .map(|entry| entry.size)
                .sum();
            if descendants.len() + 1 > limits.descendant_count {
                return Err(format!(
                    "too many descendants for tx {} [limit: {}]",
                    hash256_to_hex(&txid),
                    limits.descendant_count
                ));
            }
            if descendant_size + size > limits.descendant_size {
                return Err(format!(
                    "exceeds descendant size limit for tx {} [limit: {}]",
                    hash256_to_hex(&txid),
                    limits.descendant_size
                ));
            }
            queue.extend(entry.parents.iter().copied());
        }
        Ok(ancestors)
    }

    /// `txid` and everything in the pool spending its outputs, transitively.
    pub fn descendants(&self, txid: &Hash256) -> HashSet<Hash256> {
        let mut out = HashSet::new();
        let mut queue = VecDeque::from([*txid]);
        while let Some(next) = queue.pop_front() {
            if !out.insert(next) {
                continue;
            }
            if let Some(children) = self.children.get(&next) {
                queue.extend(children.iter().copied());
            }
        }
        out
    }

    /// Adds an entry whose inputs were already checked against the pool.
    pub fn insert(&mut self, entry: MempoolEntry) -> Result<(), MempoolError> {
        if self.entries.contains_key(&entry.txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                RejectCode::Duplicate,
                "txn-already-in-mempool",
            ));
        }
        for input in &entry.tx.vin {
            if let Some(conflict) = self.spent.get(&input.prevout) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    RejectCode::Duplicate,
                    "txn-mempool-conflict",
                )
                .with_debug(format!(
                    "input {}:{} already spent by {}",
                    hash256_to_hex(&input.prevout.hash),
                    input.prevout.index,
                    hash256_to_hex(conflict)
                )));
            }
        }
        for input in &entry.tx.vin {
            self.spent.insert(input.prevout.clone(), entry.txid);
        }
        for parent in &entry.parents {
            let children = self.children.entry(*parent).or_default();
            if !children.contains(&entry.txid) {
                children.push(entry.txid);
            }
        }
        // A transaction returning from a disconnected block may already have
        // spenders in the pool that were admitted while it was confirmed.
        for child in self.spenders_of(&entry.txid, entry.tx.vout.len()) {
            if let Some(child_entry) = self.entries.get_mut(&child) {
                if !child_entry.parents.contains(&entry.txid) {
                    child_entry.parents.push(entry.txid);
                }
            }
            let children = self.children.entry(entry.txid).or_default();
            if !children.contains(&child) {
                children.push(child);
            }
        }
        self.total_bytes += entry.size;
        self.usage += entry.usage();
        self.entries.insert(entry.txid, entry);
        self.revision += 1;
        Ok(())
    }

    /// Removes one entry. Its in-pool children stay and lose the parent link.
    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        self.usage = self.usage.saturating_sub(entry.usage());
        for input in &entry.tx.vin {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
        }
        for parent in &entry.parents {
            let now_empty = match self.children.get_mut(parent) {
                Some(children) => {
                    children.retain(|child| child != txid);
                    children.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.children.remove(parent);
            }
        }
        if let Some(children) = self.children.remove(txid) {
            for child in children {
                if let Some(child_entry) = self.entries.get_mut(&child) {
                    child_entry.parents.retain(|parent| parent != txid);
                }
            }
        }
        self.revision += 1;
        Some(entry)
    }

    /// Removes `txid` and all of its descendants, children first.
    pub fn remove_recursive(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(*txid, false)];
        while let Some((next, expanded)) = stack.pop() {
            if expanded {
                order.push(next);
                continue;
            }
            if !visited.insert(next) {
                continue;
            }
            stack.push((next, true));
            if let Some(children) = self.children.get(&next) {
                for child in children {
                    stack.push((*child, false));
                }
            }
        }
        order
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect()
    }

    /// Pool entries spending any of the first `outputs` outputs of `txid`.
    fn spenders_of(&self, txid: &Hash256, outputs: usize) -> Vec<Hash256> {
        let mut spenders = Vec::new();
        for index in 0..outputs {
            let Ok(index) = u32::try_from(index) else {
                break;
            };
            if let Some(spender) = self.spent.get(&OutPoint::new(*txid, index)) {
                if !spenders.contains(spender) {
                    spenders.push(*spender);
                }
            }
        }
        spenders
    }

    /// Removes everything in the pool that spends outputs of `tx`, which is
    /// neither confirmed nor pooled any more.
    pub fn remove_spends_of(&mut self, tx: &Transaction) -> Vec<Hash256> {
        let mut removed = Vec::new();
        for spender in self.spenders_of(&tx.txid(), tx.vout.len()) {
            removed.extend(self.remove_recursive(&spender).into_iter().map(|entry| entry.txid));
        }
        removed
    }

    /// Drops the block's transactions and anything else spending their inputs.
    pub fn remove_for_block(&mut self, transactions: &[Transaction]) -> BlockRemoval {
        let mut removal = BlockRemoval::default();
        for tx in transactions {
            let txid = tx.txid();
            if self.remove(&txid).is_some() {
                removal.confirmed.push(txid);
            }
        }
        for tx in transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                let Some(conflict) = self.spent.get(&input.prevout).copied() else {
                    continue;
                };
                for removed in self.remove_recursive(&conflict) {
                    removal.conflicts.push(removed.txid);
                }
            }
        }
        if !removal.conflicts.is_empty() {
            pivxd_log::log_print!(
                Category::Mempool,
                "removed {} conflicting transactions",
                removal.conflicts.len()
            );
        }
        removal
    }

    /// After blocks were disconnected: drops entries that are no longer
    /// final at `next_height`, that spend outputs gone from both the pool and
    /// `view`, or that spend reward outputs which are now immature.
    pub fn remove_for_reorg<V: CoinView>(
        &mut self,
        view: &V,
        next_height: i32,
        lock_time_cutoff: i64,
        maturity: i32,
    ) -> Result<Vec<Hash256>, StoreError> {
        let mut doomed = Vec::new();
        for entry in self.entries.values() {
            if !is_final_tx(&entry.tx, next_height, lock_time_cutoff) {
                doomed.push(entry.txid);
                continue;
            }
            for input in &entry.tx.vin {
                if self.entries.contains_key(&input.prevout.hash) {
                    continue;
                }
                let invalid = match view.get(&input.prevout)? {
                    Some(coin) => coin.is_reward() && next_height - coin.height < maturity,
                    None => true,
                };
                if invalid {
                    doomed.push(entry.txid);
                    break;
                }
            }
        }
        let mut removed = Vec::new();
        for txid in doomed {
            removed.extend(self.remove_recursive(&txid).into_iter().map(|entry| entry.txid));
        }
        Ok(removed)
    }

    /// Removes entries accepted before `cutoff`, with their descendants.
    pub fn expire(&mut self, cutoff: i64) -> usize {
        let old: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| entry.time < cutoff)
            .map(|entry| entry.txid)
            .collect();
        let mut removed = 0;
        for txid in old {
            removed += self.remove_recursive(&txid).len();
        }
        removed
    }

    /// Evicts the package with the lowest descendant fee rate until usage
    /// is within `limit`.
    pub fn trim_to_size(&mut self, limit: usize) -> Vec<Hash256> {
        let mut evicted = Vec::new();
        while self.usage > limit {
            let Some(worst) = self.lowest_descendant_score() else {
                break;
            };
            evicted.extend(self.remove_recursive(&worst).into_iter().map(|entry| entry.txid));
        }
        if !evicted.is_empty() {
            pivxd_log::log_print!(
                Category::Mempool,
                "trimmed {} transactions to fit {} bytes",
                evicted.len(),
                limit
            );
        }
        evicted
    }

    /// Expiry followed by trimming, as done after admission and reorgs.
    pub fn limit_size(&mut self, limit: usize, expiry_cutoff: i64) -> Vec<Hash256> {
        let expired = self.expire(expiry_cutoff);
        if expired > 0 {
            pivxd_log::log_print!(
                Category::Mempool,
                "expired {expired} transactions from the memory pool"
            );
        }
        self.trim_to_size(limit)
    }

    fn lowest_descendant_score(&self) -> Option<Hash256> {
        let mut worst: Option<(Hash256, i128, i128, i64)> = None;
        for entry in self.entries.values() {
            let descendants = self.descendants(&entry.txid);
            let (fees, size) = descendants
                .iter()
                .filter_map(|id| self.entries.get(id))
                .fold((0i128, 0i128), |(fees, size), item| {
                    (fees + i128::from(item.fee), size + item.size.max(1) as i128)
                });
            let replace = match worst {
                None => true,
                Some((txid, worst_fees, worst_size, worst_time)) => {
                    let left = fees * worst_size;
                    let right = worst_fees * size;
                    left < right
                        || (left == right
                            && (entry.time > worst_time
                                || (entry.time == worst_time && entry.txid > txid)))
                }
            };
            if replace {
                worst = Some((entry.txid, fees, size, entry.time));
            }
        }
        worst.map(|(txid, ..)| txid)
    }
}
