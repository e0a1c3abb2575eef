//! Network upgrade schedule.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum UpgradeIndex {
    BaseNetwork = 0,
    TestDummy = 1,
    Pos = 2,
    PosV2 = 3,
    Zc = 4,
    ZcV2 = 5,
    Bip65 = 6,
    ZcPublic = 7,
    V3_4 = 8,
    V4_0 = 9,
    V5_0 = 10,
}

pub const MAX_NETWORK_UPGRADES: usize = 11;

pub const ALL_UPGRADES: [UpgradeIndex; MAX_NETWORK_UPGRADES] = [
    UpgradeIndex::BaseNetwork,
    UpgradeIndex::TestDummy,
    UpgradeIndex::Pos,
    UpgradeIndex::PosV2,
    UpgradeIndex::Zc,
    UpgradeIndex::ZcV2,
    UpgradeIndex::Bip65,
    UpgradeIndex::ZcPublic,
    UpgradeIndex::V3_4,
    UpgradeIndex::V4_0,
    UpgradeIndex::V5_0,
];

impl UpgradeIndex {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        NETWORK_UPGRADE_NAMES[self.as_usize()]
    }
}

pub type Hash256 = [u8; 32];

#[derive(Clone, Copy, Debug)]
pub struct NetworkUpgrade {
    pub protocol_version: i32,
    pub activation_height: i32,
    pub hash_activation_block: Option<Hash256>,
}

impl NetworkUpgrade {
    pub const ALWAYS_ACTIVE: i32 = 0;
    pub const NO_ACTIVATION_HEIGHT: i32 = -1;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpgradeState {
    Disabled,
    Pending,
    Active,
}

const NETWORK_UPGRADE_NAMES: [&str; MAX_NETWORK_UPGRADES] = [
    "Base",
    "Test dummy",
    "PoS",
    "PoS v2",
    "Zerocoin",
    "Zerocoin v2",
    "BIP65",
    "Zerocoin Public",
    "v3.4.0",
    "v4.0.0",
    "v5.0.0",
];

pub fn network_upgrade_state(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
    idx: UpgradeIndex,
) -> UpgradeState {
    let activation_height = upgrades[idx.as_usize()].activation_height;
    if activation_height == NetworkUpgrade::NO_ACTIVATION_HEIGHT {
        UpgradeState::Disabled
    } else if height >= activation_height {
        UpgradeState::Active
    } else {
        UpgradeState::Pending
    }
}

pub fn network_upgrade_active(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
    idx: UpgradeIndex,
) -> bool {
    network_upgrade_state(height, upgrades, idx) == UpgradeState::Active
}

pub fn current_epoch(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
) -> UpgradeIndex {
    for idx in ALL_UPGRADES.iter().rev() {
        if network_upgrade_active(height, upgrades, *idx) {
            return *idx;
        }
    }
    UpgradeIndex::BaseNetwork
}

pub fn next_epoch(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
) -> Option<UpgradeIndex> {
    if height < 0 {
        return None;
    }
    ALL_UPGRADES
        .iter()
        .skip(1)
        .find(|idx| network_upgrade_state(height, upgrades, **idx) == UpgradeState::Pending)
        .copied()
}

pub fn next_activation_height(
    height: i32,
    upgrades: &[NetworkUpgrade; MAX_NETWORK_UPGRADES],
) -> Option<i32> {
    next_epoch(height, upgrades).map(|idx| upgrades[idx.as_usize()].activation_height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{consensus_params, Network};

    #[test]
    fn mainnet_activation_edges() {
        let params = consensus_params(Network::Mainnet);

        assert!(!network_upgrade_active(
            863_786,
            &params.upgrades,
            UpgradeIndex::Zc
        ));
        assert!(network_upgrade_active(
            863_787,
            &params.upgrades,
            UpgradeIndex::Zc
        ));
        assert!(!network_upgrade_active(
            0,
            &params.upgrades,
            UpgradeIndex::TestDummy
        ));
    }

    #[test]
    fn epoch_tracking() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(current_epoch(0, &params.upgrades), UpgradeIndex::BaseNetwork);
        assert_eq!(current_epoch(259_201, &params.upgrades), UpgradeIndex::Pos);
        assert_eq!(next_activation_height(0, &params.upgrades), Some(259_201));
        assert_eq!(UpgradeIndex::V4_0.name(), "v4.0.0");
    }

    #[test]
    fn regtest_disabled_upgrades() {
        let params = consensus_params(Network::Regtest);
        assert_eq!(
            network_upgrade_state(10_000, &params.upgrades, UpgradeIndex::Zc),
            UpgradeState::Disabled
        );
        assert!(network_upgrade_active(0, &params.upgrades, UpgradeIndex::Bip65));
    }
}
