//! Consensus constants, parameters, and upgrade schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;
pub mod upgrades;

pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams, Checkpoint,
    ConsensusParams, GenesisParams, Network,
};
pub use rewards::{block_value, masternode_payment};
pub use upgrades::Hash256;
