//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use pivxd_consensus::upgrades::UpgradeIndex;
use pivxd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

/// Blocks averaged by Dark Gravity Wave.
const DGW_PAST_BLOCKS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    NonContiguous,
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::NonContiguous => write!(f, "header list must be contiguous by height"),
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

/// The header fields retargeting looks at, oldest first in the slices passed around here.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i32,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if (bits & 0x0080_0000) != 0 && word != 0 {
        return Err(CompactError::Negative);
    }
    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if word != 0
            && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32))
        {
            return Err(CompactError::Overflow);
        }
        U256::from(word) << (8 * (size - 3))
    };
    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }
    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };
    // Keep the mantissa positive.
    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }
    (size << 24) | (compact & 0x007f_ffff)
}

pub fn u256_from_hash(hash: &Hash256) -> U256 {
    U256::from_little_endian(hash)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(u256_from_hash(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    u256_from_hash(hash) <= u256_from_hash(target)
}

pub fn cmp_hash(a: &Hash256, b: &Hash256) -> Ordering {
    u256_from_hash(a).cmp(&u256_from_hash(b))
}

/// Expected number of hashes to find a block at `bits`: `2^256 / (target + 1)`.
pub fn block_proof(bits: u32) -> U256 {
    match compact_to_u256(bits) {
        Ok(target) if !target.is_zero() => (!target / (target + U256::one())) + U256::one(),
        _ => U256::zero(),
    }
}

/// Bits required for the block following the last entry of `chain`.
///
/// `chain` holds the most recent headers, oldest first and contiguous; at least
/// 25 entries are needed for a full proof-of-work window, two for stake retargeting.
pub fn next_work_required(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit = u256_from_hash(&params.pow_limit);
    let Some(last) = chain.last() else {
        return Ok(u256_to_compact(pow_limit));
    };
    ensure_contiguous(chain)?;
    if params.pow_no_retargeting {
        return Ok(last.bits);
    }
    if last.height == 0 || (last.height as usize) < DGW_PAST_BLOCKS {
        return Ok(u256_to_compact(pow_limit));
    }

    let next_height = last.height + 1;
    if params.upgrade_active(next_height, UpgradeIndex::Pos) {
        return stake_next_work_required(chain, params);
    }
    dark_gravity_wave(chain, pow_limit, params)
}

fn stake_next_work_required(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let last = chain[chain.len() - 1];
    let next_height = last.height + 1;
    let time_v2 = params.is_time_protocol_v2(next_height);
    let target_limit = u256_from_hash(params.pos_limit_for(time_v2));
    let spacing = params.target_spacing;
    let timespan = params.target_timespan_for(time_v2);

    let mut actual_spacing = match chain.len().checked_sub(2).map(|idx| chain[idx]) {
        Some(prev) => last.time - prev.time,
        None => 0,
    };
    if actual_spacing < 0 {
        actual_spacing = 1;
    }
    if time_v2 && actual_spacing > spacing * 10 {
        actual_spacing = spacing * 10;
    }

    let mut target = compact_to_u256(last.bits)?;
    // First block under the new time protocol eases the target 16x.
    if time_v2 && !params.is_time_protocol_v2(last.height) {
        target = target << 4;
    }
    let interval = timespan / spacing;
    let numerator = (interval - 1) * spacing + actual_spacing + actual_spacing;
    let denominator = (interval + 1) * spacing;
    target = target.saturating_mul(U256::from(numerator as u64)) / U256::from(denominator as u64);

    if target.is_zero() || target > target_limit {
        target = target_limit;
    }
    Ok(u256_to_compact(target))
}

fn dark_gravity_wave(
    chain: &[HeaderInfo],
    pow_limit: U256,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let mut count = 0u64;
    let mut average = U256::zero();
    let mut actual_timespan = 0i64;
    let mut last_time = 0i64;

    for header in chain.iter().rev().take(DGW_PAST_BLOCKS) {
        if header.height == 0 {
            break;
        }
        count += 1;
        let target = compact_to_u256(header.bits)?;
        average = if count == 1 {
            target
        } else {
            (average.saturating_mul(U256::from(count)) + target) / U256::from(count + 1)
        };
        if last_time > 0 {
            actual_timespan += last_time - header.time;
        }
        last_time = header.time;
    }

    let target_timespan = count as i64 * params.target_spacing;
    actual_timespan = actual_timespan.clamp(target_timespan / 3, target_timespan * 3);

    let mut target = average.saturating_mul(U256::from(actual_timespan as u64))
        / U256::from(target_timespan.max(1) as u64);
    if target > pow_limit {
        target = pow_limit;
    }
    Ok(u256_to_compact(target))
}

fn ensure_contiguous(chain: &[HeaderInfo]) -> Result<(), DifficultyError> {
    let base = chain[0].height;
    for (offset, header) in chain.iter().enumerate() {
        if header.height != base + offset as i32 {
            return Err(DifficultyError::NonContiguous);
        }
    }
    Ok(())
}
