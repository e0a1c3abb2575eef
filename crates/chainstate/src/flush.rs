//! Writing the block index and the coin cache to disk.
//!
//! Block and undo files are synced first, then the dirty index entries and
//! file summaries go out in one batch, and only then the coins. A crash in
//! between leaves an index that is ahead of the coins, which reconnecting
//! the missing blocks repairs.

use std::time::{Duration, Instant};

use pivxd_log::Category;
use pivxd_storage::{KeyValueStore, WriteBatch};

use crate::state::{ChainState, ChainStateError};

/// Headroom kept below the coin cache limit before a periodic flush triggers.
const COIN_CACHE_HEADROOM: usize = 10 << 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    /// Only when the coin cache is over its limit.
    IfNeeded,
    /// When the cache is close to its limit or an interval has passed.
    Periodic,
    Always,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushDecision {
    /// Sync block files and write the block index.
    pub write: bool,
    /// Also write the coin cache.
    pub flush_coins: bool,
}

#[derive(Debug)]
pub struct FlushSchedule {
    write_interval: Duration,
    flush_interval: Duration,
    last_write: Instant,
    last_flush: Instant,
}

impl FlushSchedule {
    pub fn new(write_interval: Duration, flush_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            write_interval,
            flush_interval,
            last_write: now,
            last_flush: now,
        }
    }

    pub fn decide(
        &self,
        mode: FlushMode,
        cache_usage: usize,
        cache_limit: usize,
        now: Instant,
    ) -> FlushDecision {
        let large_threshold = (cache_limit / 10 * 9).max(cache_limit.saturating_sub(COIN_CACHE_HEADROOM));
        let cache_large = mode == FlushMode::Periodic && cache_usage > large_threshold;
        let cache_critical = mode != FlushMode::Always && cache_usage > cache_limit;
        let periodic_write = mode == FlushMode::Periodic
            && now.saturating_duration_since(self.last_write) > self.write_interval;
        let periodic_flush = mode == FlushMode::Periodic
            && now.saturating_duration_since(self.last_flush) > self.flush_interval;

        let flush_coins =
            mode == FlushMode::Always || cache_large || cache_critical || periodic_flush;
        FlushDecision {
            write: flush_coins || periodic_write,
            flush_coins,
        }
    }

    fn record(&mut self, decision: FlushDecision, now: Instant) {
        if decision.write {
            self.last_write = now;
        }
        if decision.flush_coins {
            self.last_flush = now;
        }
    }
}

impl<S: KeyValueStore + Clone> ChainState<S> {
    /// Persists state according to `mode`. Any failure aborts the node.
    pub fn flush_state_to_disk(&mut self, mode: FlushMode) -> Result<(), ChainStateError> {
        self.ensure_running()?;
        let start = Instant::now();
        let cache_usage = self.coins.dynamic_memory_usage();
        let decision =
            self.flush_schedule
                .decide(mode, cache_usage, self.config.coin_cache_bytes, start);
        if !decision.write {
            return Ok(());
        }
        if let Err(err) = self.write_to_disk(decision.flush_coins) {
            return Err(self.abort(err));
        }
        self.flush_schedule.record(decision, start);
        self.metrics.record_flush(start.elapsed());
        pivxd_log::log_print!(
            Category::CoinDb,
            "flushed state ({mode:?}, coins: {}, cache {} bytes) in {} ms",
            decision.flush_coins,
            cache_usage,
            start.elapsed().as_millis()
        );
        Ok(())
    }

    fn write_to_disk(&mut self, flush_coins: bool) -> Result<(), ChainStateError> {
        self.storage.sync()?;

        let mut batch = WriteBatch::new();
        for (kind, file_id, info) in self.storage.take_dirty_infos() {
            self.tree_db.put_file_info(&mut batch, kind, file_id, &info);
        }
        self.tree_db
            .put_last_block_file(&mut batch, self.storage.last_block_file());
        for id in self.index.take_dirty() {
            self.tree_db.put_node(&mut batch, &self.index.stored(id));
        }
        self.tree_db.write(&batch)?;

        if flush_coins {
            self.coins.flush()?;
            self.coins.base().store().sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 100 << 20;

    #[test]
    fn if_needed_waits_for_the_limit() {
        let schedule = FlushSchedule::new(Duration::from_secs(3600), Duration::from_secs(86_400));
        let now = Instant::now();
        assert_eq!(
            schedule.decide(FlushMode::IfNeeded, LIMIT - 1, LIMIT, now),
            FlushDecision::default()
        );
        let over = schedule.decide(FlushMode::IfNeeded, LIMIT + 1, LIMIT, now);
        assert!(over.write && over.flush_coins);
    }

    #[test]
    fn periodic_flushes_a_large_cache() {
        let schedule = FlushSchedule::new(Duration::from_secs(3600), Duration::from_secs(86_400));
        let now = Instant::now();
        let large = schedule.decide(FlushMode::Periodic, LIMIT - (5 << 20), LIMIT, now);
        assert!(large.flush_coins);
        let small = schedule.decide(FlushMode::Periodic, LIMIT / 2, LIMIT, now);
        assert_eq!(small, FlushDecision::default());
    }

    #[test]
    fn periodic_write_and_flush_intervals() {
        let mut schedule = FlushSchedule::new(Duration::from_secs(10), Duration::from_secs(100));
        let start = Instant::now();
        let later = start + Duration::from_secs(11);
        let decision = schedule.decide(FlushMode::Periodic, 0, LIMIT, later);
        assert_eq!(
            decision,
            FlushDecision {
                write: true,
                flush_coins: false
            }
        );
        schedule.record(decision, later);
        assert_eq!(
            schedule.decide(FlushMode::Periodic, 0, LIMIT, later + Duration::from_secs(1)),
            FlushDecision::default()
        );
        let much_later = start + Duration::from_secs(101);
        assert!(schedule
            .decide(FlushMode::Periodic, 0, LIMIT, much_later)
            .flush_coins);
    }

    #[test]
    fn always_writes_everything() {
        let schedule = FlushSchedule::new(Duration::from_secs(3600), Duration::from_secs(86_400));
        let decision = schedule.decide(FlushMode::Always, 0, LIMIT, Instant::now());
        assert!(decision.write && decision.flush_coins);
    }
}
