//! Recoverable heap errors.
//!
//! Exhaustion is the only condition the heap reports as a value. Contract
//! violations and corruption panic at the point of detection.

use thiserror::Error;

/// Failure to satisfy an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The private region could not supply the block.
    #[error("private heap exhausted while allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    /// Header plus requested size does not fit the address space.
    #[error("allocation of {requested} bytes overflows the block layout")]
    SizeOverflow { requested: usize },
}

/// Registry invariant found broken by [`crate::PrivateHeap::check_integrity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("registry head has a predecessor")]
    HeadHasPrev,
    #[error("block #{serial} is not the predecessor of its successor")]
    BrokenBackLink { serial: u64 },
    #[error("registry walk did not terminate within {limit} steps")]
    Cycle { limit: usize },
    #[error("registry records {recorded} blocks but {counted} are linked")]
    LengthMismatch { counted: usize, recorded: usize },
    #[error("registry records {recorded} bytes but linked blocks hold {counted}")]
    ByteMismatch { counted: usize, recorded: usize },
    #[error("serial number {serial} appears more than once")]
    DuplicateSerial { serial: u64 },
}
