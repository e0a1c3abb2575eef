//! Chain state: the block tree, the active chain and the coin view at its tip.
//!
//! [`ChainState`] owns every structure the block pipeline mutates. Callers
//! serialize access to it (the node keeps it behind a mutex), so nothing in
//! here locks.
//!
//! Blocks flow through three stages:
//!
//! 1. [`ChainState::process_new_block`] runs the context-free checks.
//! 2. [`ChainState::accept_block`] checks the block against its parent,
//!    indexes it and appends it to the block files.
//! 3. [`ChainState::activate_best_chain`] (in `reorg`) moves the active chain
//!    to the candidate with the most work.
//!
//! Rejections carry a [`Rejection`]; local faults (disk, database, corrupt
//! undo data) latch the state into an aborted mode in which every further
//! mutation fails with [`ChainStateError::Aborted`].

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use pivxd_consensus::constants::DEFAULT_MAX_REORG_DEPTH;
use pivxd_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use pivxd_log::Category;
use pivxd_pow::{next_work_required, HeaderInfo};
use pivxd_primitives::block::{Block, BlockHeader};
use pivxd_primitives::genesis_block;
use pivxd_storage::{KeyValueStore, StoreError};

use crate::blockindex::{
    BlockIndex, NodeId, BLOCK_FAILED_CHILD, BLOCK_FAILED_VALID, BLOCK_HAVE_DATA, BLOCK_HAVE_UNDO,
    BLOCK_VALID_SCRIPTS, BLOCK_VALID_TRANSACTIONS,
};
use crate::blockstore::BlockStorage;
use crate::candidates::{CandidateSet, UnlinkedBlocks};
use crate::chain::ActiveChain;
use crate::coins::{CoinView, CoinsDb, CoinsViewCache};
use crate::connect::{add_outputs, connect_transactions, ConnectContext, ConnectedBlock};
use crate::flatfiles::{FileLocation, FlatFileError};
use crate::flush::FlushSchedule;
use crate::index::BlockTreeDb;
use crate::metrics::ConnectMetrics;
use crate::payments::{AcceptAllPayments, AcceptAllStakes, PaymentValidator, StakeValidator};
use crate::reject::{RejectCode, Rejection};
use crate::scriptcheck::{ScriptVerifier, DEFAULT_SCRIPT_CACHE_ENTRIES};
use crate::undo::{BlockUndo, UndoError};
use crate::validation::{
    check_block, contextual_check_block, contextual_check_block_header, HeaderContext,
    ValidationFlags,
};

pub const DEFAULT_DB_CACHE_BYTES: usize = 100 << 20;
pub const DEFAULT_MAX_BLOCKFILE_SIZE: u64 = 0x0800_0000;
/// Headers fed to the retarget algorithm; one more than its averaging window.
const DIFFICULTY_WINDOW: usize = 25;

#[derive(Debug)]
pub enum ChainStateError {
    /// The block or transaction broke a consensus rule.
    Rejected(Rejection),
    Store(StoreError),
    FlatFile(FlatFileError),
    Decode(String),
    Corrupt(String),
    Io(std::io::Error),
    /// A previous local fault stopped all further processing.
    Aborted(String),
    MissingParent(Hash256),
    UnknownBlock(Hash256),
}

impl ChainStateError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ChainStateError::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    /// Faults of this node rather than of the data it was given.
    pub fn is_local_fault(&self) -> bool {
        !matches!(
            self,
            ChainStateError::Rejected(_)
                | ChainStateError::MissingParent(_)
                | ChainStateError::UnknownBlock(_)
        )
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Rejected(rejection) => write!(f, "{rejection}"),
            ChainStateError::Store(err) => write!(f, "database error: {err}"),
            ChainStateError::FlatFile(err) => write!(f, "block file error: {err}"),
            ChainStateError::Decode(message) => write!(f, "decode error: {message}"),
            ChainStateError::Corrupt(message) => write!(f, "corrupt chain state: {message}"),
            ChainStateError::Io(err) => write!(f, "{err}"),
            ChainStateError::Aborted(message) => write!(f, "chain state aborted: {message}"),
            ChainStateError::MissingParent(hash) => {
                write!(f, "previous block {} not found", hash256_to_hex(hash))
            }
            ChainStateError::UnknownBlock(hash) => {
                write!(f, "block {} not found", hash256_to_hex(hash))
            }
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<Rejection> for ChainStateError {
    fn from(rejection: Rejection) -> Self {
        ChainStateError::Rejected(rejection)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<std::io::Error> for ChainStateError {
    fn from(err: std::io::Error) -> Self {
        ChainStateError::Io(err)
    }
}

impl From<UndoError> for ChainStateError {
    fn from(err: UndoError) -> Self {
        match err {
            UndoError::ChecksumMismatch => {
                ChainStateError::Corrupt("undo data checksum mismatch".to_string())
            }
            other => ChainStateError::Decode(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockStatus {
    Accepted,
    AlreadyHave,
}

/// Changes to the active chain, drained by [`ChainState::take_events`].
#[derive(Clone, Debug)]
pub enum ChainEvent {
    BlockConnected { block: Arc<Block>, height: i32 },
    /// Its non-reward transactions may return to the mempool.
    BlockDisconnected { block: Arc<Block>, height: i32 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TipInfo {
    pub hash: Hash256,
    pub height: i32,
    pub time: i64,
    pub median_time_past: i64,
    pub bits: u32,
}

#[derive(Clone, Debug)]
pub struct ChainStateConfig {
    /// Coin cache budget in bytes.
    pub coin_cache_bytes: usize,
    pub max_reorg_depth: i32,
    /// Script verification threads; 0 picks one per core.
    pub script_threads: usize,
    pub script_cache_entries: usize,
    pub max_blockfile_size: u64,
    pub write_interval: Duration,
    pub flush_interval: Duration,
    /// Re-verify block tree invariants after every activation.
    pub check_block_index: bool,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            coin_cache_bytes: DEFAULT_DB_CACHE_BYTES,
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            script_threads: 0,
            script_cache_entries: DEFAULT_SCRIPT_CACHE_ENTRIES,
            max_blockfile_size: DEFAULT_MAX_BLOCKFILE_SIZE,
            write_interval: Duration::from_secs(60 * 60),
            flush_interval: Duration::from_secs(24 * 60 * 60),
            check_block_index: false,
        }
    }
}

pub struct ChainState<S: KeyValueStore> {
    pub(crate) params: ConsensusParams,
    pub(crate) config: ChainStateConfig,
    pub(crate) index: BlockIndex,
    pub(crate) chain: ActiveChain,
    pub(crate) candidates: CandidateSet,
    pub(crate) unlinked: UnlinkedBlocks,
    pub(crate) tree_db: BlockTreeDb<S>,
    pub(crate) coins: CoinsViewCache<CoinsDb<S>>,
    pub(crate) storage: BlockStorage,
    pub(crate) scripts: ScriptVerifier,
    pub(crate) payments: Box<dyn PaymentValidator>,
    pub(crate) stakes: Box<dyn StakeValidator>,
    pub(crate) metrics: Arc<ConnectMetrics>,
    pub(crate) flush_schedule: FlushSchedule,
    pub(crate) events: Vec<ChainEvent>,
    /// Blocks that failed to connect during the current activation.
    pub(crate) connect_rejections: Vec<(Hash256, Rejection)>,
    next_sequence_id: i32,
    aborted: Option<String>,
    mock_time: Option<i64>,
}

impl<S: KeyValueStore + Clone> ChainState<S> {
    /// Opens the chain state in `blocks_dir` over `store`, loading the block
    /// index or, on an empty store, indexing and connecting the genesis block.
    pub fn open(
        params: ConsensusParams,
        config: ChainStateConfig,
        store: S,
        blocks_dir: &Path,
    ) -> Result<Self, ChainStateError> {
        let threads = match config.script_threads {
            0 => std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1),
            threads => threads,
        };
        let scripts = ScriptVerifier::new(threads, config.script_cache_entries)
            .map_err(|err| ChainStateError::Io(std::io::Error::other(err.to_string())))?;
        let tree_db = BlockTreeDb::new(store.clone());
        let storage = BlockStorage::open(
            blocks_dir,
            config.max_blockfile_size,
            tree_db.load_file_infos()?,
        )?;
        let coins = CoinsViewCache::new(CoinsDb::new(store)?);
        let flush_schedule = FlushSchedule::new(config.write_interval, config.flush_interval);

        let mut state = Self {
            params,
            config,
            index: BlockIndex::new(),
            chain: ActiveChain::new(),
            candidates: CandidateSet::new(),
            unlinked: UnlinkedBlocks::new(),
            tree_db,
            coins,
            storage,
            scripts,
            payments: Box::new(AcceptAllPayments),
            stakes: Box::new(AcceptAllStakes),
            metrics: Arc::new(ConnectMetrics::default()),
            flush_schedule,
            events: Vec::new(),
            connect_rejections: Vec::new(),
            next_sequence_id: 1,
            aborted: None,
            mock_time: None,
        };
        state.load_block_index()?;
        if state.index.is_empty() {
            state.init_genesis()?;
        }
        state.activate_best_chain()?;
        state.events.clear();
        Ok(state)
    }

    pub fn set_payment_validator(&mut self, payments: Box<dyn PaymentValidator>) {
        self.payments = payments;
    }

    pub fn set_stake_validator(&mut self, stakes: Box<dyn StakeValidator>) {
        self.stakes = stakes;
    }

    /// Pins the clock used for future-timestamp checks.
    pub fn set_mock_time(&mut self, time: Option<i64>) {
        self.mock_time = time;
    }

    pub fn adjusted_time(&self) -> i64 {
        self.mock_time.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as i64)
                .unwrap_or(0)
        })
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn config(&self) -> &ChainStateConfig {
        &self.config
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn chain(&self) -> &ActiveChain {
        &self.chain
    }

    pub fn candidates(&self) -> &CandidateSet {
        &self.candidates
    }

    pub fn coins(&self) -> &CoinsViewCache<CoinsDb<S>> {
        &self.coins
    }

    pub fn script_verifier(&self) -> &ScriptVerifier {
        &self.scripts
    }

    pub fn metrics(&self) -> Arc<ConnectMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn storage(&self) -> &BlockStorage {
        &self.storage
    }

    pub fn height(&self) -> i32 {
        self.chain.height()
    }

    pub fn tip(&self) -> Option<TipInfo> {
        let id = self.chain.tip()?;
        let node = self.index.node(id);
        Some(TipInfo {
            hash: node.hash,
            height: node.height,
            time: node.time(),
            median_time_past: self.index.median_time_past(id),
            bits: node.header.bits,
        })
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.index.lookup(hash)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn take_events(&mut self) -> Vec<ChainEvent> {
        std::mem::take(&mut self.events)
    }

    /// Runs the context-free checks on `block`, stores it if it connects to a
    /// known parent, and activates the best chain.
    pub fn process_new_block(&mut self, block: &Block) -> Result<BlockStatus, ChainStateError> {
        self.ensure_running()?;
        let hash = block.hash();
        if let Err(rejection) = check_block(block, &self.params, ValidationFlags::default()) {
            return Err(self.rejected(&hash, rejection));
        }
        let status = self.store_block(block, true)?;
        self.connect_rejections.clear();
        self.activate_best_chain()?;
        let failed = self
            .connect_rejections
            .iter()
            .find(|(failed, _)| *failed == hash)
            .map(|(_, rejection)| rejection.clone());
        if let Some(rejection) = failed {
            return Err(ChainStateError::Rejected(rejection));
        }
        if status == BlockStatus::Accepted {
            pivxd_log::log_print!(
                Category::Validation,
                "accepted block {} at height {}",
                hash256_to_hex(&hash),
                self.lookup(&hash)
                    .map_or(-1, |id| self.index.node(id).height)
            );
        }
        Ok(status)
    }

    /// Indexes `header` once its parent is known and it passes the contextual
    /// header checks.
    pub fn accept_block_header(&mut self, header: &BlockHeader) -> Result<NodeId, ChainStateError> {
        let hash = header.hash();
        if let Some(id) = self.index.lookup(&hash) {
            if self.index.node(id).is_failed() {
                return Err(self.rejected(
                    &hash,
                    Rejection::invalid(RejectCode::Duplicate, "duplicate")
                        .with_debug("block is marked invalid"),
                ));
            }
            return Ok(id);
        }
        let prev = self.parent_for(header, &hash)?;
        let ctx = self.header_context(prev);
        if let Err(rejection) =
            contextual_check_block_header(header, &hash, &ctx, &self.params)
        {
            return Err(self.rejected(&hash, rejection));
        }
        Ok(self.index.insert_header(header))
    }

    /// Checks `block` against its parent, writes it to the block files and
    /// records its transactions in the index.
    pub fn accept_block(&mut self, block: &Block) -> Result<BlockStatus, ChainStateError> {
        self.store_block(block, false)
    }

    /// `accept_block`, skipping the structural check when the caller already ran it.
    fn store_block(
        &mut self,
        block: &Block,
        structure_checked: bool,
    ) -> Result<BlockStatus, ChainStateError> {
        self.ensure_running()?;
        let hash = block.hash();
        if let Some(id) = self.index.lookup(&hash) {
            let node = self.index.node(id);
            if node.have_data() && !node.is_failed() {
                return Ok(BlockStatus::AlreadyHave);
            }
        }
        let prev = self.parent_for(&block.header, &hash)?;
        let height = self.index.node(prev).height + 1;
        if let Err(rejection) = self.check_work(&block.header, prev) {
            return Err(self.rejected(&hash, rejection));
        }
        if block.is_proof_of_stake() {
            if let Err(rejection) = self.stakes.check_stake(block, height) {
                return Err(self.rejected(&hash, rejection));
            }
        }

        let id = self.accept_block_header(&block.header)?;
        if self.index.node(id).have_data() {
            return Ok(BlockStatus::AlreadyHave);
        }
        let structure = if structure_checked {
            Ok(())
        } else {
            check_block(block, &self.params, ValidationFlags::default()).map(|_| ())
        };
        let checked = structure.and_then(|()| contextual_check_block(block, height));
        if let Err(rejection) = checked {
            if !rejection.corruption_possible {
                self.mark_invalid(id);
            }
            return Err(self.rejected(&hash, rejection));
        }

        let location = match self
            .storage
            .write_block(&block.consensus_encode(), height, block.header.time)
        {
            Ok(location) => location,
            Err(err) => return Err(self.abort(err.into())),
        };
        self.received_block_transactions(block, id, location);
        Ok(BlockStatus::Accepted)
    }

    /// Full validity check of a block template on top of the current tip
    /// without changing any state.
    pub fn test_block_validity(
        &mut self,
        block: &Block,
        flags: ValidationFlags,
    ) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        let hash = block.hash();
        let prev = self.parent_for(&block.header, &hash)?;
        if self.chain.tip() != Some(prev) {
            return Err(Rejection::invalid(RejectCode::Invalid, "bad-prevblk")
                .with_debug("block does not build on the active tip")
                .into());
        }
        let ctx = self.header_context(prev);
        let height = ctx.height;
        contextual_check_block_header(&block.header, &hash, &ctx, &self.params)?;
        check_block(block, &self.params, flags)?;
        contextual_check_block(block, height)?;
        self.connect_block(block, height, true)?;
        Ok(())
    }

    pub fn read_block(&self, id: NodeId) -> Result<Block, ChainStateError> {
        let node = self.index.node(id);
        let location = node.block_pos.ok_or_else(|| {
            ChainStateError::Corrupt(format!("no data for block {}", hash256_to_hex(&node.hash)))
        })?;
        let bytes = self.storage.read_block(location)?;
        let block =
            Block::consensus_decode(&bytes).map_err(|err| ChainStateError::Decode(err.to_string()))?;
        if block.hash() != node.hash {
            return Err(ChainStateError::Corrupt(format!(
                "block file entry {}:{} does not hold {}",
                location.file_id,
                location.offset,
                hash256_to_hex(&node.hash)
            )));
        }
        Ok(block)
    }

    pub(crate) fn read_undo(&self, id: NodeId) -> Result<BlockUndo, ChainStateError> {
        let node = self.index.node(id);
        let location = node.undo_pos.ok_or_else(|| {
            ChainStateError::Corrupt(format!("no undo data for {}", hash256_to_hex(&node.hash)))
        })?;
        let bytes = self.storage.read_undo(location)?;
        Ok(BlockUndo::decode_with_checksum(&bytes, &node.header.prev_block)?)
    }

    /// Applies `block` at `height` to a throwaway layer over the tip view.
    /// Unless `just_check` is set, writes the undo data, records it on the
    /// block's node and merges the layer into the tip view.
    pub(crate) fn connect_block(
        &mut self,
        block: &Block,
        height: i32,
        just_check: bool,
    ) -> Result<ConnectedBlock, ChainStateError> {
        let start = Instant::now();
        let hash = block.hash();
        let mut view = CoinsViewCache::new(&mut self.coins);
        let best = view.best_block()?;
        let expected_best = if height == 0 {
            [0u8; 32]
        } else {
            block.header.prev_block
        };
        if best != expected_best {
            return Err(ChainStateError::Corrupt(format!(
                "coin view at {} while connecting {} on {}",
                hash256_to_hex(&best),
                hash256_to_hex(&hash),
                hash256_to_hex(&expected_best)
            )));
        }

        if height == 0 {
            // Genesis outputs enter the view but nothing is undoable.
            for tx in &block.transactions {
                add_outputs(&mut view, tx, tx.txid(), 0)?;
            }
            if just_check {
                return Ok(ConnectedBlock::default());
            }
            view.set_best_block(hash);
            view.flush()?;
            if let Some(id) = self.index.lookup(&hash) {
                self.index.node_mut(id).raise_validity(BLOCK_VALID_SCRIPTS);
                self.index.mark_dirty(id);
            }
            return Ok(ConnectedBlock::default());
        }

        let ctx = ConnectContext {
            params: &self.params,
            height,
            check_scripts: height >= self.params.last_checkpoint_height(),
            cache_scripts: !just_check,
            payments: self.payments.as_ref(),
            scripts: &self.scripts,
        };
        let connected = connect_transactions(block, &mut view, &ctx)?;
        self.metrics.record_inputs(start.elapsed());
        if just_check {
            return Ok(connected);
        }

        let Some(id) = self.index.lookup(&hash) else {
            return Err(ChainStateError::UnknownBlock(hash));
        };
        let undo_start = Instant::now();
        let bytes = connected
            .undo
            .encode_with_checksum(&block.header.prev_block);
        let location = self
            .storage
            .write_undo(&bytes, height, block.header.time)?;
        self.metrics
            .record_undo(undo_start.elapsed(), bytes.len() as u64);
        let node = self.index.node_mut(id);
        node.undo_pos = Some(location);
        node.status |= BLOCK_HAVE_UNDO;
        node.raise_validity(BLOCK_VALID_SCRIPTS);
        self.index.mark_dirty(id);

        view.set_best_block(hash);
        view.flush()?;
        self.metrics.record_connect(start.elapsed());
        Ok(connected)
    }

    /// Context handed to the contextual header checks for a child of `prev`.
    pub fn header_context(&self, prev: NodeId) -> HeaderContext {
        let node = self.index.node(prev);
        HeaderContext {
            height: node.height + 1,
            prev_time: node.time(),
            prev_median_time_past: self.index.median_time_past(prev),
            chain_height: self.chain.height(),
            adjusted_time: self.adjusted_time(),
            max_reorg_depth: self.config.max_reorg_depth,
        }
    }

    /// Bits the child of `prev` must carry.
    pub fn next_work_required(&self, prev: NodeId) -> Result<u32, Rejection> {
        let mut window = Vec::with_capacity(DIFFICULTY_WINDOW);
        let mut walk = Some(prev);
        while let Some(id) = walk {
            if window.len() == DIFFICULTY_WINDOW {
                break;
            }
            let node = self.index.node(id);
            window.push(HeaderInfo {
                height: node.height,
                time: node.time(),
                bits: node.header.bits,
            });
            walk = node.parent;
        }
        window.reverse();
        next_work_required(&window, &self.params).map_err(|err| {
            Rejection::dos(100, RejectCode::Invalid, "bad-diffbits")
                .with_debug(format!("cannot compute required work: {err}"))
        })
    }

    fn check_work(&self, header: &BlockHeader, prev: NodeId) -> Result<(), Rejection> {
        let required = self.next_work_required(prev)?;
        if header.bits != required {
            return Err(Rejection::dos(100, RejectCode::Invalid, "bad-diffbits")
                .with_debug(format!(
                    "incorrect proof of work: {:08x} instead of {required:08x}",
                    header.bits
                )));
        }
        Ok(())
    }

    fn parent_for(&self, header: &BlockHeader, hash: &Hash256) -> Result<NodeId, ChainStateError> {
        let Some(prev) = self.index.lookup(&header.prev_block) else {
            pivxd_log::log_print!(
                Category::Validation,
                "block {} has unknown parent {}",
                hash256_to_hex(hash),
                hash256_to_hex(&header.prev_block)
            );
            return Err(ChainStateError::MissingParent(header.prev_block));
        };
        if self.index.node(prev).is_failed() {
            return Err(self.rejected(
                hash,
                Rejection::dos(100, RejectCode::Invalid, "bad-prevblk")
                    .with_debug("previous block is invalid"),
            ));
        }
        Ok(prev)
    }

    /// Records that the transactions of `id` are on disk and links it, and any
    /// descendants waiting on it, into the candidate set.
    fn received_block_transactions(&mut self, block: &Block, id: NodeId, location: FileLocation) {
        let node = self.index.node_mut(id);
        node.tx_count = block.transactions.len() as u32;
        node.chain_tx = 0;
        node.block_pos = Some(location);
        node.status |= BLOCK_HAVE_DATA;
        node.raise_validity(BLOCK_VALID_TRANSACTIONS);
        let parent = node.parent;
        self.index.mark_dirty(id);

        let linked = match parent {
            None => true,
            Some(parent) => self.index.node(parent).chain_tx > 0,
        };
        if !linked {
            if let Some(parent) = parent {
                self.unlinked.insert(parent, id);
            }
            return;
        }

        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let parent_tx = self
                .index
                .node(current)
                .parent
                .map_or(0, |parent| self.index.node(parent).chain_tx);
            let sequence_id = self.next_sequence_id;
            self.next_sequence_id += 1;
            let node = self.index.node_mut(current);
            node.chain_tx = parent_tx + u64::from(node.tx_count);
            node.sequence_id = sequence_id;
            if self.is_candidate_worthy(current) {
                self.candidates.insert(&self.index, current);
            }
            queue.extend(self.unlinked.take_children(current));
        }
    }

    /// Linked, fully received, not failed, and at least as good as the tip.
    pub(crate) fn is_candidate_worthy(&self, id: NodeId) -> bool {
        let node = self.index.node(id);
        if !node.is_valid(BLOCK_VALID_TRANSACTIONS) || node.chain_tx == 0 {
            return false;
        }
        match self.chain.tip() {
            Some(tip) => !CandidateSet::better(&self.index, tip, id),
            None => true,
        }
    }

    pub(crate) fn mark_invalid(&mut self, id: NodeId) {
        self.index.node_mut(id).status |= BLOCK_FAILED_VALID;
        self.index.mark_dirty(id);
        self.candidates.remove(id);
        self.mark_descendants_failed(id);
    }

    /// Flags every indexed descendant of `id` as failed.
    pub(crate) fn mark_descendants_failed(&mut self, id: NodeId) {
        let height = self.index.node(id).height;
        let descendants: Vec<NodeId> = self
            .index
            .ids()
            .filter(|&other| {
                other != id
                    && self.index.node(other).height > height
                    && self.index.descends_from(other, id)
            })
            .collect();
        for other in descendants {
            let node = self.index.node_mut(other);
            if node.status & BLOCK_FAILED_CHILD == 0 {
                node.status |= BLOCK_FAILED_CHILD;
                self.index.mark_dirty(other);
            }
            self.candidates.remove(other);
        }
    }

    fn load_block_index(&mut self) -> Result<(), ChainStateError> {
        let stored = self.tree_db.load_nodes()?;
        if stored.is_empty() {
            return Ok(());
        }
        self.index = BlockIndex::load(stored)
            .map_err(|message| ChainStateError::Corrupt(message.to_string()))?;

        let ids: Vec<NodeId> = self.index.ids().collect();
        for &id in &ids {
            let node = self.index.node(id);
            if !node.have_data() {
                continue;
            }
            let parent = node.parent;
            let tx_count = u64::from(node.tx_count);
            match parent {
                None => self.index.node_mut(id).chain_tx = tx_count,
                Some(parent) => {
                    let parent_tx = self.index.node(parent).chain_tx;
                    if parent_tx > 0 {
                        self.index.node_mut(id).chain_tx = parent_tx + tx_count;
                    } else {
                        self.unlinked.insert(parent, id);
                    }
                }
            }
            let parent_failed = parent.is_some_and(|parent| self.index.node(parent).is_failed());
            let node = self.index.node_mut(id);
            if parent_failed && !node.is_failed() {
                node.status |= BLOCK_FAILED_CHILD;
                self.index.mark_dirty(id);
            }
        }

        let best = self.coins.best_block()?;
        let tip = if best == [0u8; 32] {
            None
        } else {
            Some(self.index.lookup(&best).ok_or_else(|| {
                ChainStateError::Corrupt(format!(
                    "coin view best block {} is not indexed",
                    hash256_to_hex(&best)
                ))
            })?)
        };
        self.chain.set_tip(&self.index, tip);
        for &id in &ids {
            if self.is_candidate_worthy(id) {
                self.candidates.insert(&self.index, id);
            }
        }
        if let Some(tip) = tip {
            self.candidates.prune_behind(&self.index, tip);
        }
        pivxd_log::log_info!(
            "loaded block index: {} entries, tip {}",
            self.index.len(),
            tip.map_or_else(
                || "none".to_string(),
                |tip| format!(
                    "{} at height {}",
                    hash256_to_hex(&self.index.node(tip).hash),
                    self.index.node(tip).height
                )
            )
        );
        Ok(())
    }

    fn init_genesis(&mut self) -> Result<(), ChainStateError> {
        let genesis = genesis_block(&self.params);
        let id = self.index.insert_header(&genesis.header);
        let location =
            self.storage
                .write_block(&genesis.consensus_encode(), 0, genesis.header.time)?;
        self.received_block_transactions(&genesis, id, location);
        pivxd_log::log_info!("initialized genesis block {}", hash256_to_hex(&genesis.hash()));
        Ok(())
    }

    pub(crate) fn ensure_running(&self) -> Result<(), ChainStateError> {
        match &self.aborted {
            Some(message) => Err(ChainStateError::Aborted(message.clone())),
            None => Ok(()),
        }
    }

    /// Latches the node into the aborted state and hands `err` back.
    pub(crate) fn abort(&mut self, err: ChainStateError) -> ChainStateError {
        if self.aborted.is_none() {
            pivxd_log::log_error!("fatal chain state error: {err}");
            self.aborted = Some(err.to_string());
        }
        err
    }

    pub(crate) fn rejected(&self, hash: &Hash256, rejection: Rejection) -> ChainStateError {
        pivxd_log::log_warn!(
            "block {} rejected: {rejection}",
            hash256_to_hex(hash)
        );
        ChainStateError::Rejected(rejection)
    }

    /// Verifies the block tree invariants. Costly; only used when
    /// `check_block_index` is set and in tests.
    pub fn check_block_index(&self) -> Result<(), ChainStateError> {
        let corrupt = |message: String| Err(ChainStateError::Corrupt(message));
        let Some(tip) = self.chain.tip() else {
            return Ok(());
        };
        let genesis_hash = genesis_block(&self.params).hash();
        match self.chain.genesis() {
            Some(genesis) if self.index.node(genesis).hash == genesis_hash => {}
            _ => return corrupt("active chain does not start at genesis".to_string()),
        }

        for height in 0..=self.chain.height() {
            let Some(id) = self.chain.at(height) else {
                return corrupt(format!("active chain has a gap at {height}"));
            };
            let node = self.index.node(id);
            if node.height != height {
                return corrupt(format!("active chain entry at {height} has height {}", node.height));
            }
            if height > 0 && node.parent != self.chain.at(height - 1) {
                return corrupt(format!("active chain is not linked at {height}"));
            }
            if !node.is_valid(BLOCK_VALID_SCRIPTS) && height > 0 {
                return corrupt(format!("active block at {height} is not fully validated"));
            }
            if height > 0 && !node.have_undo() {
                return corrupt(format!("active block at {height} has no undo data"));
            }
        }

        let tip_node = self.index.node(tip);
        for id in self.index.ids() {
            let node = self.index.node(id);
            if let Some(parent) = node.parent {
                let parent_node = self.index.node(parent);
                if parent_node.height + 1 != node.height {
                    return corrupt(format!("height of {} skips", hash256_to_hex(&node.hash)));
                }
                if node.chain_work < parent_node.chain_work {
                    return corrupt(format!("work of {} decreases", hash256_to_hex(&node.hash)));
                }
                if parent_node.is_failed() && !node.is_failed() {
                    return corrupt(format!(
                        "{} descends from a failed block",
                        hash256_to_hex(&node.hash)
                    ));
                }
                if node.chain_tx > 0 && parent_node.chain_tx == 0 {
                    return corrupt(format!(
                        "{} is linked but its parent is not",
                        hash256_to_hex(&node.hash)
                    ));
                }
            }
            if self.candidates.contains(id) {
                if node.chain_tx == 0 || node.is_failed() {
                    return corrupt(format!(
                        "candidate {} is not connectable",
                        hash256_to_hex(&node.hash)
                    ));
                }
                if node.chain_work < tip_node.chain_work {
                    return corrupt(format!(
                        "candidate {} has less work than the tip",
                        hash256_to_hex(&node.hash)
                    ));
                }
            }
        }
        if !self.candidates.contains(tip) && !tip_node.is_failed() {
            return corrupt("active tip is missing from the candidates".to_string());
        }
        Ok(())
    }
}
