#![forbid(unsafe_code)]
//! Error types for SnapDiff.
//!
//! Defines `SdfError` and a `Result<T>` alias used throughout the
//! workspace. Everything that prevents the send-stream diff from being
//! set up or driven collapses into `SendReceive`, which the public
//! wrapper treats as "fall back to the generic comparator".

use sdf_types::ParseError;
use thiserror::Error;

/// Unified error type for all SnapDiff operations.
#[derive(Debug, Error)]
pub enum SdfError {
    /// Pipe creation, send ioctl, stream parsing, resolver lookup, or a
    /// snapshot that is not a read-only subvolume.
    #[error("send/receive failed: {0}")]
    SendReceive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed send stream: {0}")]
    Stream(#[from] ParseError),
}

/// Result alias using `SdfError`.
pub type Result<T> = std::result::Result<T, SdfError>;
