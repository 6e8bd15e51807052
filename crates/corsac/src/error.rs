//! Error and Result types for corsac WAL operations.

use crate::record::SeriesRef;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for corsac operations.
pub type Result<T> = std::result::Result<T, WalError>;

/// The error type for WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Series label set was empty or contained duplicate label names.
    #[error("invalid labels: {0}")]
    InvalidLabels(String),

    /// Exemplar posted against a series ref that was never registered.
    #[error("unknown series ref: {0}")]
    UnknownSeriesRef(SeriesRef),

    /// Summed byte length of the exemplar's label names and values exceeds
    /// the limit accepted by downstream consumers.
    #[error("exemplar labels too long: {len} bytes, max {max}")]
    ExemplarLabelTooLong {
        /// Summed byte length of the exemplar label names and values.
        len: usize,
        /// Maximum allowed summed byte length.
        max: usize,
    },

    /// Exemplar label set contained duplicate label names.
    #[error("invalid exemplar: {0}")]
    InvalidExemplar(String),

    /// Operation attempted after the engine was closed.
    #[error("WAL is closed")]
    WalClosed,

    /// Invalid magic bytes in a segment header.
    #[error("invalid magic bytes: expected CWAL, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported segment format version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Record checksum does not match the stored value.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Record payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
