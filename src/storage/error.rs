//! Crate-level error and outcome types.

use thiserror::Error;

/// Recoverable errors that can occur while constructing or opening a backend.
/// Everything past this point (wrong PIN, tampering, exhaustion) is *not* an
/// `Err` — it is communicated through [`PinOutcome`] or the fault handler.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend io error: {0}")]
    Backend(String),

    #[error("storage already initialized")]
    AlreadyInitialized,

    #[error("storage not initialized")]
    NotInitialized,

    #[error("storage is locked")]
    Locked,

    #[error("key {0:#06x} belongs to a reserved or public app and cannot be used here")]
    InvalidKey(u16),

    #[error("value too large: {len} bytes")]
    ValueTooLarge { len: usize },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Tri-state result of a PIN check.
///
/// The C original overloads a `secbool` (`sectrue`/`secfalse`) for both
/// "PIN did not match" and "storage is inconsistent" — conflating an
/// expected negative outcome with a fault. This type keeps them apart: a
/// caller matches on `Fault` and forwards to the fault handler instead of
/// treating it as an ordinary wrong-PIN result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    Correct,
    Wrong,
    Fault,
}

impl PinOutcome {
    pub fn is_correct(self) -> bool {
        matches!(self, PinOutcome::Correct)
    }
}
