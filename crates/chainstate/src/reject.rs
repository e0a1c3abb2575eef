//! Validation verdicts returned by every block and transaction check.

use std::fmt;

/// Wire-level reject codes reported back to the peer that sent the object.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum RejectCode {
    Malformed = 0x01,
    Invalid = 0x10,
    Obsolete = 0x11,
    Duplicate = 0x12,
    Nonstandard = 0x40,
    Dust = 0x41,
    InsufficientFee = 0x42,
    Checkpoint = 0x43,
}

impl RejectCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A consensus or policy rejection.
///
/// `dos` is the misbehaviour score to charge the originating peer. When
/// `corruption_possible` is set the object may have been damaged in transit
/// (for example a mutated merkle tree), so it must not be remembered as
/// permanently invalid.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rejection {
    pub code: RejectCode,
    pub reason: String,
    pub debug: Option<String>,
    pub dos: u32,
    pub corruption_possible: bool,
}

pub type ValidationResult<T> = Result<T, Rejection>;

impl Rejection {
    pub fn dos(dos: u32, code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            debug: None,
            dos,
            corruption_possible: false,
        }
    }

    /// A rejection that does not penalise the sender.
    pub fn invalid(code: RejectCode, reason: impl Into<String>) -> Self {
        Self::dos(0, code, reason)
    }

    pub fn corrupt(dos: u32, code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            corruption_possible: true,
            ..Self::dos(dos, code, reason)
        }
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }

    /// True when the object violates consensus rather than local policy.
    pub fn is_consensus(&self) -> bool {
        matches!(
            self.code,
            RejectCode::Malformed
                | RejectCode::Invalid
                | RejectCode::Obsolete
                | RejectCode::Duplicate
                | RejectCode::Checkpoint
        )
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(debug) = &self.debug {
            write!(f, ", {debug}")?;
        }
        write!(f, " (code {})", self.code.as_u8())
    }
}

impl std::error::Error for Rejection {}
