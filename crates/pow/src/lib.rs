//! Compact targets, proof-of-work checks and difficulty retargeting.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, compact_to_u256, next_work_required, HeaderInfo};
pub use validation::{check_proof_of_work, PowError};
