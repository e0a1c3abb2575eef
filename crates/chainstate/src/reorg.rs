//! Moving the active chain to the best candidate.

use std::sync::Arc;
use std::time::Instant;

use pivxd_consensus::{hash256_to_hex, Hash256};
use pivxd_log::Category;
use pivxd_primitives::block::Block;
use pivxd_storage::KeyValueStore;
use primitive_types::U256;

use crate::blockindex::{NodeId, BLOCK_FAILED_CHILD, BLOCK_FAILED_MASK};
use crate::coins::{CoinView, CoinsViewCache};
use crate::connect::{disconnect_transactions, DisconnectResult};
use crate::flush::FlushMode;
use crate::reject::Rejection;
use crate::state::{ChainEvent, ChainState, ChainStateError};

/// Blocks connected per step before the best candidate is re-evaluated.
const CONNECT_STRIDE: i32 = 32;

impl<S: KeyValueStore + Clone> ChainState<S> {
    /// Connects the most-work valid chain, disconnecting back to the fork
    /// point first when needed. Invalid blocks met on the way are marked
    /// failed and the next best candidate is tried.
    pub fn activate_best_chain(&mut self) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        loop {
            let Some(most_work) = self.find_most_work_chain() else {
                break;
            };
            if self.chain.tip() == Some(most_work) {
                break;
            }
            if let Some((id, rejection)) = self.activate_best_chain_step(most_work)? {
                let hash = self.index.node(id).hash;
                self.connect_rejections.push((hash, rejection));
            }
        }
        self.flush_state_to_disk(FlushMode::Periodic)?;
        if self.config.check_block_index {
            self.check_block_index()?;
        }
        Ok(())
    }

    /// Best candidate whose whole branch down to the active chain has data
    /// and is not known invalid. Candidates failing that are dropped.
    pub(crate) fn find_most_work_chain(&mut self) -> Option<NodeId> {
        loop {
            let candidate = self.candidates.best()?;
            let mut walk = candidate;
            let mut usable = true;
            while !self.chain.contains(&self.index, walk) {
                let node = self.index.node(walk);
                let failed = node.is_failed();
                let missing_data = !node.have_data();
                let next = node.parent;
                if failed || missing_data {
                    let mut drop = candidate;
                    while drop != walk {
                        let parent = self.index.node(drop).parent;
                        if failed {
                            self.index.node_mut(drop).status |= BLOCK_FAILED_CHILD;
                            self.index.mark_dirty(drop);
                        } else if let Some(parent) = parent {
                            self.unlinked.insert(parent, drop);
                        }
                        self.candidates.remove(drop);
                        match parent {
                            Some(parent) => drop = parent,
                            None => break,
                        }
                    }
                    self.candidates.remove(walk);
                    usable = false;
                    break;
                }
                match next {
                    Some(parent) => walk = parent,
                    None => break,
                }
            }
            if usable {
                return Some(candidate);
            }
        }
    }

    /// Disconnects to the fork with `most_work` and connects up to 32 blocks
    /// at a time towards it, stopping after the first stride that leaves the
    /// tip with more work than it started with. Returns the block that failed
    /// to connect, if any.
    fn activate_best_chain_step(
        &mut self,
        most_work: NodeId,
    ) -> Result<Option<(NodeId, Rejection)>, ChainStateError> {
        let start_work = self.tip_work();
        let fork = self.chain.find_fork(&self.index, most_work);

        let mut disconnected = 0usize;
        while self.chain.tip().is_some() && self.chain.tip() != fork {
            self.disconnect_tip()?;
            disconnected += 1;
        }
        if disconnected > 0 {
            pivxd_log::log_info!(
                "reorganize: disconnected {disconnected} blocks back to {}",
                fork.map_or_else(
                    || "nothing".to_string(),
                    |fork| hash256_to_hex(&self.index.node(fork).hash)
                )
            );
        }

        let target_height = self.index.node(most_work).height;
        let mut height = fork.map_or(-1, |fork| self.index.node(fork).height);
        while height < target_height {
            let stride_end = (height + CONNECT_STRIDE).min(target_height);
            let mut to_connect = Vec::with_capacity((stride_end - height) as usize);
            let mut walk = self.index.ancestor(most_work, stride_end);
            while let Some(id) = walk {
                if self.index.node(id).height <= height {
                    break;
                }
                to_connect.push(id);
                walk = self.index.node(id).parent;
            }
            to_connect.reverse();

            for id in to_connect {
                match self.connect_tip(id) {
                    Ok(()) => height = self.index.node(id).height,
                    Err(ChainStateError::Rejected(rejection)) => {
                        if !rejection.corruption_possible {
                            self.invalid_block_found(id);
                        }
                        return Ok(Some((id, rejection)));
                    }
                    Err(err) => return Err(err),
                }
            }
            if height < target_height && self.tip_work() > start_work {
                pivxd_log::log_print!(
                    Category::Validation,
                    "reorganize: tip improved at height {height}, re-evaluating candidates"
                );
                break;
            }
        }
        Ok(None)
    }

    fn tip_work(&self) -> Option<U256> {
        self.chain
            .tip()
            .map(|tip| self.index.node(tip).chain_work)
    }

    /// Connects `id`, a child of the current tip.
    fn connect_tip(&mut self, id: NodeId) -> Result<(), ChainStateError> {
        let block = match self.read_block(id) {
            Ok(block) => block,
            Err(err) => return Err(self.abort(err)),
        };
        let height = self.index.node(id).height;
        match self.connect_block(&block, height, false) {
            Ok(connected) => {
                pivxd_log::log_print!(
                    Category::Bench,
                    "connect {}: {} txs, fees {}, {} script checks",
                    height,
                    block.transactions.len(),
                    connected.fees,
                    connected.script_checks
                );
            }
            Err(ChainStateError::Rejected(rejection)) => {
                return Err(self.rejected(&block.hash(), rejection));
            }
            Err(err) => return Err(self.abort(err)),
        }

        self.chain.set_tip(&self.index, Some(id));
        self.candidates.prune_behind(&self.index, id);
        let mode = if self.storage.take_file_rolled() {
            FlushMode::Always
        } else {
            FlushMode::IfNeeded
        };
        self.flush_state_to_disk(mode)?;
        self.events.push(ChainEvent::BlockConnected {
            block: Arc::new(block),
            height,
        });
        self.log_update_tip();
        Ok(())
    }

    /// Rolls the tip back one block using its undo data.
    fn disconnect_tip(&mut self) -> Result<(), ChainStateError> {
        let Some(tip) = self.chain.tip() else {
            return Ok(());
        };
        let start = Instant::now();
        match self.disconnect_block(tip) {
            Ok(block) => {
                let height = self.index.node(tip).height;
                let parent = self.index.node(tip).parent;
                self.chain.set_tip(&self.index, parent);
                self.flush_state_to_disk(FlushMode::Always)?;
                self.metrics.record_disconnect(start.elapsed());
                self.events.push(ChainEvent::BlockDisconnected {
                    block: Arc::new(block),
                    height,
                });
                self.log_update_tip();
                Ok(())
            }
            Err(err) => Err(self.abort(err)),
        }
    }

    fn disconnect_block(&mut self, id: NodeId) -> Result<Block, ChainStateError> {
        let block = self.read_block(id)?;
        let undo = self.read_undo(id)?;
        let (hash, height) = {
            let node = self.index.node(id);
            (node.hash, node.height)
        };
        let mut view = CoinsViewCache::new(&mut self.coins);
        let best = view.best_block()?;
        if best != hash {
            return Err(ChainStateError::Corrupt(format!(
                "coin view at {} while disconnecting {}",
                hash256_to_hex(&best),
                hash256_to_hex(&hash)
            )));
        }
        match disconnect_transactions(&block, height, &undo, &mut view)? {
            DisconnectResult::Ok => {}
            result => {
                return Err(ChainStateError::Corrupt(format!(
                    "disconnecting {} at {height}: {result:?}",
                    hash256_to_hex(&hash)
                )));
            }
        }
        view.flush()?;
        Ok(block)
    }

    /// Marks `id` invalid after a failed connect and reports the fork.
    fn invalid_block_found(&mut self, id: NodeId) {
        self.mark_invalid(id);
        let node = self.index.node(id);
        pivxd_log::log_warn!(
            "invalid block found: {} height={} log2_work={:.8}",
            hash256_to_hex(&node.hash),
            node.height,
            log2_work(node.chain_work)
        );
        if let Some(tip) = self.chain.tip() {
            let tip = self.index.node(tip);
            pivxd_log::log_warn!(
                "current tip: {} height={} log2_work={:.8}",
                hash256_to_hex(&tip.hash),
                tip.height,
                log2_work(tip.chain_work)
            );
        }
    }

    /// Marks the block invalid, disconnects it and its descendants from the
    /// active chain, and activates the best remaining candidate.
    pub fn invalidate_block(&mut self, hash: &Hash256) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        let id = self
            .index
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;
        self.mark_invalid(id);

        while self.chain.contains(&self.index, id) {
            self.disconnect_tip()?;
        }

        let ids: Vec<NodeId> = self.index.ids().collect();
        for other in ids {
            if self.is_candidate_worthy(other) {
                self.candidates.insert(&self.index, other);
            }
        }
        pivxd_log::log_info!("invalidated block {}", hash256_to_hex(hash));
        self.activate_best_chain()
    }

    /// Clears the failure flags of the block, its descendants and its
    /// ancestors, then activates the best chain again.
    pub fn reconsider_block(&mut self, hash: &Hash256) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        let id = self
            .index
            .lookup(hash)
            .ok_or(ChainStateError::UnknownBlock(*hash))?;

        let ids: Vec<NodeId> = self.index.ids().collect();
        for &other in &ids {
            if other != id && !self.index.descends_from(other, id) {
                continue;
            }
            let node = self.index.node_mut(other);
            if node.is_failed() {
                node.status &= !BLOCK_FAILED_MASK;
                self.index.mark_dirty(other);
            }
        }
        let mut walk = self.index.node(id).parent;
        while let Some(ancestor) = walk {
            let node = self.index.node_mut(ancestor);
            if node.is_failed() {
                node.status &= !BLOCK_FAILED_MASK;
                self.index.mark_dirty(ancestor);
            }
            walk = self.index.node(ancestor).parent;
        }
        for &other in &ids {
            if self.is_candidate_worthy(other) {
                self.candidates.insert(&self.index, other);
            }
        }
        pivxd_log::log_info!("reconsidered block {}", hash256_to_hex(hash));
        self.activate_best_chain()
    }

    fn log_update_tip(&self) {
        let Some(tip) = self.chain.tip() else {
            return;
        };
        let node = self.index.node(tip);
        pivxd_log::log_info!(
            "UpdateTip: new best={} height={} version={} log2_work={:.8} tx={} date={} cache={}",
            hash256_to_hex(&node.hash),
            node.height,
            node.header.version,
            log2_work(node.chain_work),
            node.chain_tx,
            node.header.time,
            self.coins.cache_size()
        );
    }
}

pub fn log2_work(work: U256) -> f64 {
    let mut value = 0f64;
    for (limb_index, limb) in work.0.iter().enumerate() {
        value += (*limb as f64) * 2f64.powi(64 * limb_index as i32);
    }
    if value <= 0.0 {
        0.0
    } else {
        value.log2()
    }
}
