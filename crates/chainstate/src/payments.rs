//! Collaborators consulted while accepting and connecting blocks.

use pivxd_consensus::money::Amount;
use pivxd_primitives::block::Block;

use crate::reject::ValidationResult;

/// Payout rules owned by the masternode and budget subsystems.
pub trait PaymentValidator: Send + Sync {
    /// Whether the block pays the expected masternode and budget payees.
    fn is_block_payee_valid(&self, block: &Block, height: i32) -> bool;

    /// Extra value a superblock at `height` may mint; zero elsewhere.
    fn budget_amount(&self, height: i32) -> Amount;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllPayments;

impl PaymentValidator for AcceptAllPayments {
    fn is_block_payee_valid(&self, _block: &Block, _height: i32) -> bool {
        true
    }

    fn budget_amount(&self, _height: i32) -> Amount {
        0
    }
}

/// Proof-of-stake kernel check for a block whose parent is known.
pub trait StakeValidator: Send + Sync {
    fn check_stake(&self, block: &Block, height: i32) -> ValidationResult<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllStakes;

impl StakeValidator for AcceptAllStakes {
    fn check_stake(&self, _block: &Block, _height: i32) -> ValidationResult<()> {
        Ok(())
    }
}
