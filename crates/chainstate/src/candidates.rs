//! Best-chain candidates and blocks waiting on a parent's data.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use primitive_types::U256;
use smallvec::SmallVec;

use crate::blockindex::{BlockIndex, NodeId};

/// Orders candidates best first: most work, then earliest arrival, then id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct CandidateKey {
    work: Reverse<U256>,
    sequence_id: i32,
    id: NodeId,
}

impl CandidateKey {
    fn of(index: &BlockIndex, id: NodeId) -> Self {
        let node = index.node(id);
        Self {
            work: Reverse(node.chain_work),
            sequence_id: node.sequence_id,
            id,
        }
    }
}

#[derive(Debug, Default)]
pub struct CandidateSet {
    ordered: BTreeSet<CandidateKey>,
    keys: HashMap<NodeId, CandidateKey>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn insert(&mut self, index: &BlockIndex, id: NodeId) {
        self.remove(id);
        let key = CandidateKey::of(index, id);
        self.ordered.insert(key);
        self.keys.insert(id, key);
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => self.ordered.remove(&key),
            None => false,
        }
    }

    pub fn best(&self) -> Option<NodeId> {
        self.ordered.first().map(|key| key.id)
    }

    /// Candidates, best first.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ordered.iter().map(|key| key.id)
    }

    /// Whether `a` sorts strictly ahead of `b`.
    pub fn better(index: &BlockIndex, a: NodeId, b: NodeId) -> bool {
        CandidateKey::of(index, a) < CandidateKey::of(index, b)
    }

    /// Drops every candidate that sorts behind `tip`; the tip itself stays.
    pub fn prune_behind(&mut self, index: &BlockIndex, tip: NodeId) {
        let tip_key = CandidateKey::of(index, tip);
        let behind = self.ordered.split_off(&tip_key);
        for key in behind {
            if key == tip_key {
                self.ordered.insert(key);
            } else {
                self.keys.remove(&key.id);
            }
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(NodeId) -> bool) {
        let keys = &mut self.keys;
        self.ordered.retain(|key| {
            let kept = keep(key.id);
            if !kept {
                keys.remove(&key.id);
            }
            kept
        });
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.keys.clear();
    }
}

/// Blocks with data whose parent chain is still missing some, keyed by parent.
#[derive(Debug, Default)]
pub struct UnlinkedBlocks {
    by_parent: HashMap<NodeId, SmallVec<[NodeId; 2]>>,
}

impl UnlinkedBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, parent: NodeId, child: NodeId) {
        let children = self.by_parent.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub fn take_children(&mut self, parent: NodeId) -> SmallVec<[NodeId; 2]> {
        self.by_parent.remove(&parent).unwrap_or_default()
    }

    pub fn remove(&mut self, parent: NodeId, child: NodeId) {
        if let Some(children) = self.by_parent.get_mut(&parent) {
            children.retain(|entry| *entry != child);
            if children.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
    }

    pub fn contains(&self, parent: NodeId, child: NodeId) -> bool {
        self.by_parent
            .get(&parent)
            .is_some_and(|children| children.contains(&child))
    }

    pub fn len(&self) -> usize {
        self.by_parent.values().map(SmallVec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_parent.is_empty()
    }
}
