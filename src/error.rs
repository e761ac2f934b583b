//! Error types for the replayer
//!
//! Only the variants of [`ReplayError`] stop a run. Per-line problems
//! (arity mismatches, undecodable fields, unresolved handles, divergences)
//! are warnings counted by [`crate::logging::ReplayLogger`] and never
//! surface here.

use thiserror::Error;
use crate::types::FormatVersion;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Command line error: {0}")]
    CommandLine(#[from] CommandLineError),

    #[error("Source file error: {0}")]
    SourceFile(#[from] SourceFileError),

    #[error("Fatal live API error at line {line}: {source}")]
    LiveApi { line: usize, source: LiveError },

    #[error("Snapshot error: {0}")]
    Serialization(#[from] SerializationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Missing format tag line")]
    MissingTag,

    #[error("Unrecognized format tag: expected {expected:?}, found {found:?}")]
    BadTag { expected: String, found: String },

    #[error("Missing format version line")]
    MissingVersion,

    #[error("Malformed format version: {found:?}")]
    BadVersion { found: String },

    #[error("Unsupported format version {version}")]
    UnsupportedVersion { version: FormatVersion },

    #[error("Configuration block starting at line {line} has no Config,End")]
    UnterminatedConfig { line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandLineError {
    #[error("Invalid line range: {0}")]
    InvalidRange(#[from] RangeParseError),

    #[error("Invalid value {value:?} for {option}")]
    InvalidValue { option: String, value: String },

    #[error("Invalid options: {reason}")]
    InvalidOptions { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeParseError {
    #[error("empty item in range list {list:?}")]
    EmptyItem { list: String },

    #[error("unparsable number in range item {item:?}")]
    InvalidNumber { item: String },

    #[error("inverted range {start}-{end}")]
    InvertedRange { start: usize, end: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceFileError {
    #[error("Cannot read {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Source file {path} is empty")]
    Empty { path: String },
}

/// Failure reported by the live allocator.
///
/// Every variant except [`LiveError::DeviceLost`] is an ordinary call
/// failure that the reconciler compares against the recorded outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveError {
    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("too many objects")]
    TooManyObjects,

    #[error("feature not present")]
    FeatureNotPresent,

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("device lost: {reason}")]
    DeviceLost { reason: String },
}

impl LiveError {
    /// Whether the live API can no longer be trusted after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, LiveError::DeviceLost { .. })
    }
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Serialization failed: {reason}")]
    SerializationFailed { reason: String },

    #[error("Deserialization failed: {reason}")]
    DeserializationFailed { reason: String },

    #[error("Writing {path} failed: {reason}")]
    WriteFailed { path: String, reason: String },
}
