//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE_CURRENT: u32 = 2_000_000;
/// Block size ceiling before the Zerocoin upgrade.
pub const MAX_BLOCK_SIZE_LEGACY: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS_CURRENT: u32 = MAX_BLOCK_SIZE_CURRENT / 50;
pub const MAX_BLOCK_SIGOPS_LEGACY: u32 = MAX_BLOCK_SIZE_LEGACY / 50;
/// The maximum number of sigops a single relayed transaction may carry (policy).
pub const MAX_TX_SIGOPS_CURRENT: u32 = MAX_BLOCK_SIGOPS_CURRENT / 5;
pub const MAX_TX_SIGOPS_LEGACY: u32 = MAX_BLOCK_SIGOPS_LEGACY / 5;
/// Serialized size ceiling of a non-coinbase transaction (network rule).
pub const MAX_TX_SIZE: u32 = 1_000_000;
/// Largest transaction relayed by policy.
pub const MAX_STANDARD_TX_SIZE: u32 = 100_000;
/// Upper bound for the extra payload carried by special transactions.
pub const MAX_SPECIALTX_EXTRAPAYLOAD: usize = 10_000;

/// Default depth below the active tip past which competing forks are refused.
pub const DEFAULT_MAX_REORG_DEPTH: i32 = 100;

/// Threshold for `lock_time`: below this value it is a block height, otherwise a timestamp.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Use GetMedianTimePast() instead of nTime for end point timestamp.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Standard locktime verify flags used by non-consensus code.
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 = LOCKTIME_MEDIAN_TIME_PAST;

/// Number of previous blocks feeding the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_923;

pub fn max_block_size(zerocoin_active: bool) -> u32 {
    if zerocoin_active {
        MAX_BLOCK_SIZE_CURRENT
    } else {
        MAX_BLOCK_SIZE_LEGACY
    }
}

pub fn max_block_sigops(zerocoin_active: bool) -> u32 {
    max_block_size(zerocoin_active) / 50
}

pub fn max_tx_sigops(zerocoin_active: bool) -> u32 {
    max_block_sigops(zerocoin_active) / 5
}
