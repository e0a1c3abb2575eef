use pivxd_consensus::{ConsensusParams, Hash256};
use pivxd_primitives::block::BlockHeader;

use crate::difficulty::{compact_to_u256, u256_from_hash, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    ZeroTarget,
    AboveLimit,
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::ZeroTarget => write!(f, "pow target is zero"),
            PowError::AboveLimit => write!(f, "pow target above limit"),
            PowError::HashMismatch => write!(f, "pow hash does not meet target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that `hash` satisfies the target encoded in `bits` and that the target is within the limit.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::ZeroTarget);
    }
    if target > u256_from_hash(&params.pow_limit) {
        return Err(PowError::AboveLimit);
    }
    if u256_from_hash(hash) > target {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}

pub fn check_header_pow(header: &BlockHeader, params: &ConsensusParams) -> Result<(), PowError> {
    check_proof_of_work(&header.hash(), header.bits, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivxd_consensus::{consensus_params, Network};

    #[test]
    fn target_bounds() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0x1f00_ffff, &params),
            Err(PowError::AboveLimit)
        );
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0x0100_0000, &params),
            Err(PowError::ZeroTarget)
        );
        assert_eq!(
            check_proof_of_work(&[0xff; 32], 0x1d00_ffff, &params),
            Err(PowError::HashMismatch)
        );
        assert!(check_proof_of_work(&[0u8; 32], 0x1d00_ffff, &params).is_ok());
    }

    #[test]
    fn hash_equal_to_target_passes() {
        let params = consensus_params(Network::Regtest);
        let mut hash = [0u8; 32];
        hash[29..].copy_from_slice(&[0xff, 0xff, 0x7f]);
        assert!(check_proof_of_work(&hash, 0x207f_ffff, &params).is_ok());
        hash[28] = 1;
        assert_eq!(
            check_proof_of_work(&hash, 0x207f_ffff, &params),
            Err(PowError::HashMismatch)
        );
    }
}
