//! Block value schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

/// Total value a block at `height` may create, excluding fees.
pub fn block_value(height: i32, params: &ConsensusParams) -> Amount {
    if let Some(fixed) = params.fixed_block_value {
        return fixed;
    }
    if params.high_inflation_blocks && height > 1 && height < 201 {
        return 250_000 * COIN;
    }

    let last = params.reward_last_tier_height;
    if last >= 0 && height > last {
        return 5 * COIN;
    }
    const TIERS: [(i32, Amount); 9] = [
        (648_000, 45 * COIN / 10),
        (604_800, 9 * COIN),
        (561_600, 135 * COIN / 10),
        (518_400, 18 * COIN),
        (475_200, 225 * COIN / 10),
        (432_000, 27 * COIN),
        (388_800, 315 * COIN / 10),
        (345_600, 36 * COIN),
        (302_400, 405 * COIN / 10),
    ];
    for (floor, value) in TIERS {
        if height > floor {
            return value;
        }
    }
    if height > params.reward_second_tier_height {
        return 45 * COIN;
    }
    if height > 86_400 {
        return 225 * COIN;
    }
    if height != 1 {
        return 250 * COIN;
    }
    // Premine for the first masternodes.
    60_001 * COIN
}

pub fn masternode_payment() -> Amount {
    3 * COIN
}
