//! The active chain: a height-indexed path from genesis to the tip.

use crate::blockindex::{BlockIndex, NodeId};

#[derive(Debug, Default)]
pub struct ActiveChain {
    nodes: Vec<NodeId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn genesis(&self) -> Option<NodeId> {
        self.nodes.first().copied()
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.nodes.last().copied()
    }

    /// Height of the tip, or -1 for an empty chain.
    pub fn height(&self) -> i32 {
        self.nodes.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<NodeId> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.nodes.get(height).copied())
    }

    pub fn contains(&self, index: &BlockIndex, id: NodeId) -> bool {
        self.at(index.node(id).height) == Some(id)
    }

    /// Successor of `id` on the active chain.
    pub fn next(&self, index: &BlockIndex, id: NodeId) -> Option<NodeId> {
        if self.contains(index, id) {
            self.at(index.node(id).height + 1)
        } else {
            None
        }
    }

    /// Makes `tip` the last element, rewriting only the part that differs.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: Option<NodeId>) {
        let Some(tip) = tip else {
            self.nodes.clear();
            return;
        };
        let height = index.node(tip).height as usize;
        self.nodes.truncate(height + 1);
        if self.nodes.len() < height + 1 {
            // Placeholder entries are overwritten by the walk below.
            self.nodes.resize(height + 1, tip);
        }
        let mut walk = Some(tip);
        while let Some(id) = walk {
            let node = index.node(id);
            let slot = &mut self.nodes[node.height as usize];
            if *slot == id && id != tip {
                break;
            }
            *slot = id;
            walk = node.parent;
        }
    }

    /// Last common block of the active chain and the branch ending at `id`.
    pub fn find_fork(&self, index: &BlockIndex, id: NodeId) -> Option<NodeId> {
        let mut walk = id;
        if index.node(walk).height > self.height() {
            walk = index.ancestor(walk, self.height())?;
        }
        while !self.contains(index, walk) {
            walk = index.node(walk).parent?;
        }
        Some(walk)
    }
}
