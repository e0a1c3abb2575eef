//! Block validation, the block tree, the coin view and chain selection.

pub mod blockindex;
pub mod blockstore;
pub mod candidates;
pub mod chain;
pub mod coins;
pub mod connect;
pub mod filemeta;
pub mod flatfiles;
pub mod flush;
pub mod index;
pub mod metrics;
pub mod payments;
pub mod reject;
pub mod reorg;
pub mod scriptcheck;
pub mod state;
pub mod undo;
pub mod validation;

pub use reject::{RejectCode, Rejection, ValidationResult};
pub use state::{BlockStatus, ChainEvent, ChainState, ChainStateConfig, ChainStateError, TipInfo};
