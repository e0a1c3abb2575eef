//! In-memory block index tree.
//!
//! Nodes live in an arena and refer to their parent and skip ancestor by
//! [`NodeId`]. Nodes are never removed while the index is loaded.

use std::collections::{HashMap, HashSet};

use pivxd_consensus::constants::MEDIAN_TIME_SPAN;
use pivxd_consensus::Hash256;
use pivxd_pow::block_proof;
use pivxd_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::flatfiles::FileLocation;

pub const BLOCK_VALID_UNKNOWN: u32 = 0;
/// Parsed, version ok, hash satisfies claimed PoW, timestamp not in the future.
pub const BLOCK_VALID_HEADER: u32 = 1;
/// All parent headers found, difficulty and time checks passed.
pub const BLOCK_VALID_TREE: u32 = 2;
/// Structural and contextual block checks passed; parents have at least this tier.
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
/// Outputs do not overspend inputs, no double spends, coinbase value ok.
pub const BLOCK_VALID_CHAIN: u32 = 4;
/// Scripts and signatures ok.
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 7;

pub const BLOCK_HAVE_DATA: u32 = 8;
pub const BLOCK_HAVE_UNDO: u32 = 16;
pub const BLOCK_HAVE_MASK: u32 = BLOCK_HAVE_DATA | BLOCK_HAVE_UNDO;

pub const BLOCK_FAILED_VALID: u32 = 32;
/// Descends from a failed block.
pub const BLOCK_FAILED_CHILD: u32 = 64;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug)]
pub struct BlockNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub parent: Option<NodeId>,
    pub skip: Option<NodeId>,
    pub height: i32,
    pub chain_work: U256,
    pub status: u32,
    /// Arrival order among blocks whose transactions are known; ties in work go to the lowest.
    pub sequence_id: i32,
    pub tx_count: u32,
    /// Transactions in this block and all its ancestors; zero while any of them lacks data.
    pub chain_tx: u64,
    pub block_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
}

impl BlockNode {
    pub fn time(&self) -> i64 {
        i64::from(self.header.time)
    }

    pub fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    pub fn have_data(&self) -> bool {
        self.status & BLOCK_HAVE_DATA != 0
    }

    pub fn have_undo(&self) -> bool {
        self.status & BLOCK_HAVE_UNDO != 0
    }

    pub fn validity(&self) -> u32 {
        self.status & BLOCK_VALID_MASK
    }

    pub fn is_valid(&self, up_to: u32) -> bool {
        !self.is_failed() && self.validity() >= up_to
    }

    /// Raises the validity tier. Returns whether anything changed.
    pub fn raise_validity(&mut self, up_to: u32) -> bool {
        if self.is_failed() || self.validity() >= up_to {
            return false;
        }
        self.status = (self.status & !BLOCK_VALID_MASK) | up_to;
        true
    }
}

/// A node as persisted; parent, skip and chain work are derived on load.
#[derive(Clone, Debug)]
pub struct StoredNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub block_pos: Option<FileLocation>,
    pub undo_pos: Option<FileLocation>,
}

#[derive(Debug, Default)]
pub struct BlockIndex {
    nodes: Vec<BlockNode>,
    by_hash: HashMap<Hash256, NodeId>,
    dirty: HashSet<NodeId>,
    best_header: Option<NodeId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn node(&self, id: NodeId) -> &BlockNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockNode {
        &mut self.nodes[id.index()]
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn best_header(&self) -> Option<NodeId> {
        self.best_header
    }

    /// Adds a header whose parent, if any, is already indexed. Returns the
    /// existing node when the header is known.
    pub fn insert_header(&mut self, header: &BlockHeader) -> NodeId {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            return id;
        }
        let parent = self.lookup(&header.prev_block);
        let (height, parent_work) = match parent {
            Some(parent) => {
                let node = self.node(parent);
                (node.height + 1, node.chain_work)
            }
            None => (0, U256::zero()),
        };
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(BlockNode {
            hash,
            header: header.clone(),
            parent,
            skip: None,
            height,
            chain_work: parent_work.saturating_add(block_proof(header.bits)),
            status: BLOCK_VALID_UNKNOWN,
            sequence_id: 0,
            tx_count: 0,
            chain_tx: 0,
            block_pos: None,
            undo_pos: None,
        });
        self.by_hash.insert(hash, id);
        self.build_skip(id);
        self.node_mut(id).raise_validity(BLOCK_VALID_TREE);
        self.update_best_header(id);
        self.dirty.insert(id);
        id
    }

    /// Rebuilds the tree from persisted nodes: links parents, recomputes chain
    /// work and skip pointers. Nodes must form a closed tree.
    pub fn load(stored: Vec<StoredNode>) -> Result<Self, &'static str> {
        let mut stored = stored;
        stored.sort_by_key(|node| node.height);
        let mut index = Self::new();
        for record in stored {
            let parent = if record.height == 0 {
                None
            } else {
                Some(
                    index
                        .lookup(&record.header.prev_block)
                        .ok_or("block index entry without parent")?,
                )
            };
            let parent_work = match parent {
                Some(parent) => {
                    let node = index.node(parent);
                    if node.height + 1 != record.height {
                        return Err("block index height mismatch");
                    }
                    node.chain_work
                }
                None => U256::zero(),
            };
            let id = NodeId(index.nodes.len() as u32);
            index.nodes.push(BlockNode {
                hash: record.hash,
                chain_work: parent_work.saturating_add(block_proof(record.header.bits)),
                header: record.header,
                parent,
                skip: None,
                height: record.height,
                status: record.status,
                sequence_id: 0,
                tx_count: record.tx_count,
                chain_tx: 0,
                block_pos: record.block_pos,
                undo_pos: record.undo_pos,
            });
            index.by_hash.insert(record.hash, id);
            index.build_skip(id);
            if !index.node(id).is_failed() {
                index.update_best_header(id);
            }
        }
        Ok(index)
    }

    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        let start = self.node(id);
        if height > start.height || height < 0 {
            return None;
        }
        let mut walk = id;
        let mut walk_height = start.height;
        while walk_height > height {
            let node = self.node(walk);
            let skip_at = skip_height(walk_height);
            let skip_at_prev = skip_height(walk_height - 1);
            // Only follow the skip if its parent's skip is not a better fit.
            let take_skip = node.skip.is_some()
                && (skip_at == height
                    || (skip_at > height
                        && !(skip_at_prev < skip_at - 2 && skip_at_prev >= height)));
            if take_skip {
                walk = node.skip?;
                walk_height = skip_at;
            } else {
                walk = node.parent?;
                walk_height -= 1;
            }
        }
        Some(walk)
    }

    /// Whether `id` is `ancestor` or one of its descendants.
    pub fn descends_from(&self, id: NodeId, ancestor: NodeId) -> bool {
        self.ancestor(id, self.node(ancestor).height) == Some(ancestor)
    }

    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(id);
        while let Some(current) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.node(current);
            times.push(node.time());
            walk = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    pub fn mark_dirty(&mut self, id: NodeId) {
        self.dirty.insert(id);
    }

    pub fn take_dirty(&mut self) -> Vec<NodeId> {
        let mut dirty: Vec<NodeId> = self.dirty.drain().collect();
        dirty.sort();
        dirty
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn stored(&self, id: NodeId) -> StoredNode {
        let node = self.node(id);
        StoredNode {
            hash: node.hash,
            header: node.header.clone(),
            height: node.height,
            status: node.status,
            tx_count: node.tx_count,
            block_pos: node.block_pos,
            undo_pos: node.undo_pos,
        }
    }

    fn build_skip(&mut self, id: NodeId) {
        let node = self.node(id);
        let skip = match node.parent {
            Some(parent) => self.ancestor(parent, skip_height(node.height)),
            None => None,
        };
        self.node_mut(id).skip = skip;
    }

    fn update_best_header(&mut self, id: NodeId) {
        let better = match self.best_header {
            Some(best) => self.node(id).chain_work > self.node(best).chain_work,
            None => true,
        };
        if better {
            self.best_header = Some(id);
        }
    }
}

/// Turns the lowest set bit off.
fn invert_lowest_one(n: i32) -> i32 {
    n & (n - 1)
}

/// Height the skip pointer of a node at `height` points to.
pub fn skip_height(height: i32) -> i32 {
    if height < 2 {
        return 0;
    }
    // Odd heights jump further back so that walking down mixes long and short hops.
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}
