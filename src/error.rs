//! Error types for the StripeGuard library

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the StripeGuard library
#[derive(Error, Debug)]
pub enum Error {
    /// Geometry rejected at construction (width, parity set, block sizes)
    #[error("Invalid RAID geometry: {0}")]
    InvalidGeometry(String),

    /// A computed scatter-gather run exceeds the largest supported sg list.
    /// Callers fall back to a smaller per-pass window on this error, so it
    /// must stay distinct from generic failures.
    #[error("Resource insufficient: sg run needs {required} elements, max is {max}")]
    ResourceInsufficient { required: usize, max: usize },

    /// Arena could not deliver the requested buffer
    #[error("Allocation failed for {blocks} blocks: {reason}")]
    AllocationFailed { blocks: u64, reason: String },

    /// Synchronous submit failure from the storage edge
    #[error("Dispatch failed for position {position}: {reason}")]
    DispatchFailed { position: u32, reason: String },

    /// State machine driven with the wrong algorithm tag
    #[error("Algorithm mismatch: expected {expected}, got {actual}")]
    AlgorithmMismatch {
        expected: &'static str,
        actual: String,
    },

    /// Programming invariant violation; fatal to the current siots only
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
