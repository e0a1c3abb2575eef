//! Block import from bootstrap files.
//!
//! A bootstrap file is a sequence of `magic | u32 length | block` records.
//! Records may appear in any order; blocks whose parent is not known yet
//! wait in an orphan map until it arrives.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::time::Instant;

use pivxd_chainstate::{BlockStatus, ChainStateError};
use pivxd_consensus::constants::MAX_BLOCK_SIZE_CURRENT;
use pivxd_consensus::{hash256_to_hex, Hash256};
use pivxd_log::Category;
use pivxd_primitives::block::Block;
use pivxd_storage::KeyValueStore;

use crate::context::ValidationContext;

/// Smallest record worth decoding: a header plus a transaction count.
const MIN_RECORD_LEN: u32 = 81;

#[derive(Debug)]
pub enum ImportError {
    Io(std::io::Error),
    Chain(ChainStateError),
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::Io(err) => write!(f, "{err}"),
            ImportError::Chain(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ImportError {}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::Io(err)
    }
}

impl From<ChainStateError> for ImportError {
    fn from(err: ChainStateError) -> Self {
        ImportError::Chain(err)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImportStats {
    pub records: u64,
    pub accepted: u64,
    pub already_have: u64,
    pub rejected: u64,
    pub undecodable: u64,
    /// Blocks whose parent never showed up.
    pub orphans: u64,
}

/// Sequential record reader that resynchronizes on the network magic.
pub struct BootstrapReader<R> {
    reader: R,
    magic: [u8; 4],
    offset: u64,
}

impl<R: Read> BootstrapReader<R> {
    pub fn new(reader: R, magic: [u8; 4]) -> Self {
        Self {
            reader,
            magic,
            offset: 0,
        }
    }

    /// Byte offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Raw payload of the next record, or `None` at end of input.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, std::io::Error> {
        loop {
            if !self.seek_magic()? {
                return Ok(None);
            }
            let mut len = [0u8; 4];
            if !self.read_exact_or_eof(&mut len)? {
                return Ok(None);
            }
            let len = u32::from_le_bytes(len);
            if !(MIN_RECORD_LEN..=MAX_BLOCK_SIZE_CURRENT).contains(&len) {
                pivxd_log::log_print!(
                    Category::Reindex,
                    "skipping record with bad length {len} at offset {}",
                    self.offset
                );
                continue;
            }
            let mut payload = vec![0u8; len as usize];
            if !self.read_exact_or_eof(&mut payload)? {
                pivxd_log::log_warn!("bootstrap file truncated at offset {}", self.offset);
                return Ok(None);
            }
            return Ok(Some(payload));
        }
    }

    fn seek_magic(&mut self) -> Result<bool, std::io::Error> {
        let mut window = [0u8; 4];
        if !self.read_exact_or_eof(&mut window)? {
            return Ok(false);
        }
        while window != self.magic {
            let mut byte = [0u8; 1];
            if !self.read_exact_or_eof(&mut byte)? {
                return Ok(false);
            }
            window.rotate_left(1);
            window[3] = byte[0];
        }
        Ok(true)
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, std::io::Error> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => return Ok(false),
                Ok(read) => {
                    filled += read;
                    self.offset += read as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }
}

pub fn import_file<S: KeyValueStore + Clone>(
    ctx: &ValidationContext<S>,
    path: &Path,
    magic: [u8; 4],
) -> Result<ImportStats, ImportError> {
    let file = File::open(path)?;
    pivxd_log::log_info!("importing blocks from {}", path.display());
    let start = Instant::now();
    let stats = import_blocks(ctx, BootstrapReader::new(BufReader::new(file), magic))?;
    pivxd_log::log_info!(
        "imported {} blocks from {} in {}ms ({} already known, {} rejected, {} orphans)",
        stats.accepted,
        path.display(),
        start.elapsed().as_millis(),
        stats.already_have,
        stats.rejected,
        stats.orphans
    );
    Ok(stats)
}

pub fn import_blocks<S: KeyValueStore + Clone, R: Read>(
    ctx: &ValidationContext<S>,
    mut reader: BootstrapReader<R>,
) -> Result<ImportStats, ImportError> {
    let mut stats = ImportStats::default();
    let mut orphans: HashMap<Hash256, Vec<Block>> = HashMap::new();

    while let Some(payload) = reader.next_record()? {
        stats.records += 1;
        let block = match Block::consensus_decode(&payload) {
            Ok(block) => block,
            Err(err) => {
                stats.undecodable += 1;
                pivxd_log::log_warn!(
                    "undecodable block before offset {}: {err}",
                    reader.offset()
                );
                continue;
            }
        };

        let mut queue = vec![block];
        while let Some(block) = queue.pop() {
            let hash = block.hash();
            match ctx.process_block(&block) {
                Ok(status) => {
                    match status {
                        BlockStatus::Accepted => stats.accepted += 1,
                        BlockStatus::AlreadyHave => stats.already_have += 1,
                    }
                    if let Some(children) = orphans.remove(&hash) {
                        queue.extend(children);
                    }
                }
                Err(ChainStateError::MissingParent(prev)) => {
                    pivxd_log::log_print!(
                        Category::Reindex,
                        "block {} waits for parent {}",
                        hash256_to_hex(&hash),
                        hash256_to_hex(&prev)
                    );
                    orphans.entry(prev).or_default().push(block);
                }
                Err(err) if err.is_local_fault() => return Err(err.into()),
                Err(err) => {
                    stats.rejected += 1;
                    pivxd_log::log_warn!(
                        "imported block {} rejected: {err}",
                        hash256_to_hex(&hash)
                    );
                }
            }
        }
    }

    stats.orphans = orphans.values().map(|blocks| blocks.len() as u64).sum();
    Ok(stats)
}
