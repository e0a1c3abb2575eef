//! Script evaluation, legacy signature hashing, standard templates and sigop accounting.

pub mod interpreter;
pub mod opcodes;
pub mod sighash;
pub mod sigops;
pub mod standard;

pub use interpreter::{
    verify_script, ScriptError, ScriptFlags, SignatureChecker, TransactionSignatureChecker,
};
pub use sighash::{signature_hash, SighashType};
pub use standard::{classify_script_pubkey, ScriptType};
