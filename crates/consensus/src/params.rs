//! Consensus parameter definitions.

use crate::money::{Amount, COIN};
use crate::upgrades::{network_upgrade_active, Hash256, NetworkUpgrade, UpgradeIndex, MAX_NETWORK_UPGRADES};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

/// Inputs for the genesis block, which is assembled in code rather than pinned by hash.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub time: u32,
    pub nonce: u32,
    pub bits: u32,
    pub version: i32,
    pub reward: Amount,
    pub coinbase_message: &'static str,
    pub output_pubkey: &'static str,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub genesis: GenesisParams,
    pub pow_limit: Hash256,
    pub pos_limit: Hash256,
    /// Stake target ceiling once time protocol v2 is active.
    pub pos_limit_v2: Hash256,
    pub target_spacing: i64,
    pub target_timespan: i64,
    pub target_timespan_v2: i64,
    /// Regtest keeps the previous block's bits instead of retargeting.
    pub pow_no_retargeting: bool,
    pub time_slot_length: i64,
    pub future_time_drift_pow: i64,
    pub future_time_drift_pos: i64,
    pub coinbase_maturity: i32,
    /// Blocks stamped after this time use the current size and sigop ceilings.
    pub zc_time_start: i64,
    /// Testnet/mainnet second reward tier boundary.
    pub reward_second_tier_height: i32,
    /// Height after which the tail reward of 5 coins applies.
    pub reward_last_tier_height: i32,
    /// Testnet distributes a large fixed reward for heights 2..=200.
    pub high_inflation_blocks: bool,
    pub fixed_block_value: Option<Amount>,
    pub upgrades: [NetworkUpgrade; MAX_NETWORK_UPGRADES],
    pub checkpoints: Vec<Checkpoint>,
    /// Consensus checks tied to wall clock or timestamps are skipped on regtest.
    pub skip_time_checks: bool,
}

impl ConsensusParams {
    pub fn upgrade_active(&self, height: i32, idx: UpgradeIndex) -> bool {
        network_upgrade_active(height, &self.upgrades, idx)
    }

    pub fn is_time_protocol_v2(&self, height: i32) -> bool {
        self.upgrade_active(height, UpgradeIndex::V4_0)
    }

    pub fn pos_limit_for(&self, time_v2: bool) -> &Hash256 {
        if time_v2 {
            &self.pos_limit_v2
        } else {
            &self.pos_limit
        }
    }

    pub fn target_timespan_for(&self, time_v2: bool) -> i64 {
        if time_v2 {
            self.target_timespan_v2
        } else {
            self.target_timespan
        }
    }

    pub fn is_pos_active(&self, height: i32) -> bool {
        self.upgrade_active(height, UpgradeIndex::Pos)
    }

    /// Allowed future drift for a block at `height`, in seconds.
    pub fn future_block_time_drift(&self, height: i32) -> i64 {
        if self.is_time_protocol_v2(height) {
            return self.time_slot_length - 1;
        }
        if self.is_pos_active(height) {
            self.future_time_drift_pos
        } else {
            self.future_time_drift_pow
        }
    }

    /// Time protocol v2 requires block times aligned to the slot length.
    pub fn is_valid_block_timestamp(&self, time: i64, height: i32) -> bool {
        if !self.is_time_protocol_v2(height) {
            return true;
        }
        time % self.time_slot_length == 0
    }

    pub fn last_checkpoint_height(&self) -> i32 {
        self.checkpoints.last().map(|cp| cp.height).unwrap_or(0)
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.height == height)
    }

    pub fn zerocoin_active_at_time(&self, time: i64) -> bool {
        time > self.zc_time_start
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex string into an internal little-endian hash.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// Inverse of [`hash256_from_hex`].
pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub require_standard: bool,
    pub data_dir_name: &'static str,
}

pub fn chain_params(network: Network) -> ChainParams {
    let (message_start, default_port, require_standard, data_dir_name) = match network {
        Network::Mainnet => ([0x90, 0xc4, 0xfd, 0xe9], 51_472, true, ""),
        Network::Testnet => ([0xf5, 0xe6, 0xd5, 0xca], 51_474, true, "testnet5"),
        Network::Regtest => ([0xa1, 0xcf, 0x7e, 0xac], 51_476, false, "regtest"),
    };
    ChainParams {
        network,
        consensus: consensus_params(network),
        message_start,
        default_port,
        require_standard,
        data_dir_name,
    }
}

const GENESIS_MESSAGE: &str =
    "U.S. News & World Report Jan 28 2016 With His Absence, Trump Dominates Another Debate";
const GENESIS_PUBKEY: &str = "04c10e83b2703ccf322f7dbd62dd5855ac7c10bd055814ce121ba32607d573b8810c02c0582aed05b4deb9c4b77b26d92428c61256cd42774babea0a073b2ed0c9";

fn upgrade(protocol_version: i32, activation_height: i32) -> NetworkUpgrade {
    NetworkUpgrade {
        protocol_version,
        activation_height,
        hash_activation_block: None,
    }
}

fn upgrades_from(heights: [i32; MAX_NETWORK_UPGRADES]) -> [NetworkUpgrade; MAX_NETWORK_UPGRADES] {
    const PROTOCOLS: [i32; MAX_NETWORK_UPGRADES] = [
        70_000, 70_000, 70_000, 70_000, 70_000, 70_000, 70_000, 70_000, 70_918, 70_920, 70_922,
    ];
    let mut out = [upgrade(0, NetworkUpgrade::NO_ACTIVATION_HEIGHT); MAX_NETWORK_UPGRADES];
    for (idx, slot) in out.iter_mut().enumerate() {
        *slot = upgrade(PROTOCOLS[idx], heights[idx]);
    }
    out
}

fn mainnet_consensus_params() -> ConsensusParams {
    let upgrades = upgrades_from([
        NetworkUpgrade::ALWAYS_ACTIVE,
        NetworkUpgrade::NO_ACTIVATION_HEIGHT,
        259_201,
        615_800,
        863_787,
        1_153_160,
        1_808_634,
        1_880_000,
        1_967_000,
        2_153_200,
        2_700_500,
    ]);
    ConsensusParams {
        network: Network::Mainnet,
        genesis: GenesisParams {
            time: 1_454_124_731,
            nonce: 2_402_015,
            bits: 0x1e0f_fff0,
            version: 1,
            reward: 250 * COIN,
            coinbase_message: GENESIS_MESSAGE,
            output_pubkey: GENESIS_PUBKEY,
        },
        pow_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pow limit"),
        pos_limit: hash256_from_hex(
            "000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pos limit"),
        pos_limit_v2: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pos limit v2"),
        target_spacing: 60,
        target_timespan: 40 * 60,
        target_timespan_v2: 30 * 60,
        pow_no_retargeting: false,
        time_slot_length: 15,
        future_time_drift_pow: 7_200,
        future_time_drift_pos: 180,
        coinbase_maturity: 100,
        zc_time_start: 1_508_214_600,
        reward_second_tier_height: 151_200,
        reward_last_tier_height: upgrades[UpgradeIndex::ZcV2.as_usize()].activation_height,
        high_inflation_blocks: false,
        fixed_block_value: None,
        upgrades,
        checkpoints: Vec::new(),
        skip_time_checks: false,
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    let upgrades = upgrades_from([
        NetworkUpgrade::ALWAYS_ACTIVE,
        NetworkUpgrade::NO_ACTIVATION_HEIGHT,
        201,
        51_197,
        201_576,
        444_020,
        851_019,
        1_106_100,
        1_214_000,
        1_347_000,
        1_501_000,
    ]);
    ConsensusParams {
        network: Network::Testnet,
        genesis: GenesisParams {
            time: 1_608_422_399,
            nonce: 2_433_759,
            bits: 0x1e0f_fff0,
            version: 1,
            reward: 250 * COIN,
            coinbase_message: GENESIS_MESSAGE,
            output_pubkey: GENESIS_PUBKEY,
        },
        pow_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pow limit"),
        pos_limit: hash256_from_hex(
            "000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pos limit"),
        pos_limit_v2: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pos limit v2"),
        target_spacing: 60,
        target_timespan: 40 * 60,
        target_timespan_v2: 30 * 60,
        pow_no_retargeting: false,
        time_slot_length: 15,
        future_time_drift_pow: 7_200,
        future_time_drift_pos: 180,
        coinbase_maturity: 15,
        zc_time_start: 1_501_776_000,
        reward_second_tier_height: 145_000,
        reward_last_tier_height: 648_000,
        high_inflation_blocks: true,
        fixed_block_value: None,
        upgrades,
        checkpoints: Vec::new(),
        skip_time_checks: false,
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    let upgrades = upgrades_from([
        NetworkUpgrade::ALWAYS_ACTIVE,
        NetworkUpgrade::NO_ACTIVATION_HEIGHT,
        251,
        251,
        NetworkUpgrade::NO_ACTIVATION_HEIGHT,
        NetworkUpgrade::NO_ACTIVATION_HEIGHT,
        NetworkUpgrade::ALWAYS_ACTIVE,
        NetworkUpgrade::NO_ACTIVATION_HEIGHT,
        251,
        251,
        NetworkUpgrade::NO_ACTIVATION_HEIGHT,
    ]);
    ConsensusParams {
        network: Network::Regtest,
        genesis: GenesisParams {
            time: 1_454_124_731,
            nonce: 2_402_015,
            bits: 0x207f_ffff,
            version: 1,
            reward: 250 * COIN,
            coinbase_message: GENESIS_MESSAGE,
            output_pubkey: GENESIS_PUBKEY,
        },
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pow limit"),
        pos_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pos limit"),
        pos_limit_v2: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pos limit v2"),
        target_spacing: 60,
        target_timespan: 40 * 60,
        target_timespan_v2: 30 * 60,
        pow_no_retargeting: true,
        time_slot_length: 15,
        future_time_drift_pow: 7_200,
        future_time_drift_pos: 180,
        coinbase_maturity: 100,
        zc_time_start: 0,
        reward_second_tier_height: 151_200,
        reward_last_tier_height: NetworkUpgrade::NO_ACTIVATION_HEIGHT,
        high_inflation_blocks: false,
        fixed_block_value: Some(250 * COIN),
        upgrades,
        checkpoints: Vec::new(),
        skip_time_checks: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip_reverses_bytes() {
        let hash = hash256_from_hex("0x01").expect("hash");
        assert_eq!(hash[0], 1);
        assert!(hash[1..].iter().all(|b| *b == 0));
        assert_eq!(
            hash256_to_hex(&hash),
            "0000000000000000000000000000000000000000000000000000000000000001"
        );
        assert!(hash256_from_hex("zz").is_err());
        assert!(hash256_from_hex("").is_err());
    }

    #[test]
    fn mainnet_upgrade_heights() {
        let params = consensus_params(Network::Mainnet);
        assert!(!params.is_pos_active(259_200));
        assert!(params.is_pos_active(259_201));
        assert!(params.is_time_protocol_v2(2_153_200));
        assert_eq!(params.reward_last_tier_height, 1_153_160);
        assert_eq!(params.coinbase_maturity, 100);
    }

    #[test]
    fn future_drift_by_phase() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(params.future_block_time_drift(100), 7_200);
        assert_eq!(params.future_block_time_drift(300_000), 180);
        assert_eq!(params.future_block_time_drift(2_200_000), 14);
    }

    #[test]
    fn time_mask_only_after_v2() {
        let params = consensus_params(Network::Mainnet);
        assert!(params.is_valid_block_timestamp(1_000_001, 100));
        assert!(!params.is_valid_block_timestamp(1_000_001, 2_200_000));
        assert!(params.is_valid_block_timestamp(1_000_005, 2_200_000));
    }

    #[test]
    fn network_names_parse() {
        assert_eq!(Network::parse("Main"), Some(Network::Mainnet));
        assert_eq!(Network::parse("regtest"), Some(Network::Regtest));
        assert_eq!(Network::parse("signet"), None);
        assert_eq!(chain_params(Network::Testnet).default_port, 51_474);
    }
}
