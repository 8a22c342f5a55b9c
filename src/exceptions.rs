//! Error types for flavorpack

use std::fmt;

/// Main error type for flavorpack operations
#[derive(Debug)]
pub enum FlavorError {
    /// Package format not supported
    UnsupportedFormat(String),

    /// Container structure violates the format (bad sentinel, misaligned slot,
    /// descriptor outside the file)
    FormatViolation(String),

    /// Package verification failed
    VerificationFailed(String),

    /// Caller supplied something the format cannot express (unknown op code,
    /// bad compression level, non-Ed25519 key material)
    InvalidInput(String),

    /// A codec named in a slot's op chain is not compiled into this binary
    CodecUnavailable(String),

    /// Read request outside the bounds of the backing file
    OffsetOutOfRange {
        offset: u64,
        len: usize,
        size: u64,
    },

    /// Backend used after close
    AlreadyClosed,

    /// Mmap backend refused an empty file
    EmptyFile,

    /// Workenv lock could not be acquired or cleared
    LockError(String),

    /// Build error
    BuildError(String),

    /// Launch error
    LaunchError(String),

    /// IO error
    IoError(std::io::Error),

    /// JSON parsing error
    JsonError(serde_json::Error),

    /// Generic error with message
    Generic(String),
}

impl fmt::Display for FlavorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlavorError::UnsupportedFormat(msg) => write!(f, "Unsupported format: {msg}"),
            FlavorError::FormatViolation(msg) => write!(f, "Format violation: {msg}"),
            FlavorError::VerificationFailed(msg) => write!(f, "Verification failed: {msg}"),
            FlavorError::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            FlavorError::CodecUnavailable(codec) => {
                write!(f, "Codec unavailable: {codec} support is not compiled in")
            }
            FlavorError::OffsetOutOfRange { offset, len, size } => write!(
                f,
                "Read out of range: offset {offset} + len {len} exceeds file size {size}"
            ),
            FlavorError::AlreadyClosed => write!(f, "Backend already closed"),
            FlavorError::EmptyFile => write!(f, "Cannot memory-map an empty file"),
            FlavorError::LockError(msg) => write!(f, "Lock error: {msg}"),
            FlavorError::BuildError(msg) => write!(f, "Build error: {msg}"),
            FlavorError::LaunchError(msg) => write!(f, "Launch error: {msg}"),
            FlavorError::IoError(err) => write!(f, "IO error: {err}"),
            FlavorError::JsonError(err) => write!(f, "JSON error: {err}"),
            FlavorError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for FlavorError {}

impl From<std::io::Error> for FlavorError {
    fn from(err: std::io::Error) -> Self {
        FlavorError::IoError(err)
    }
}

impl From<serde_json::Error> for FlavorError {
    fn from(err: serde_json::Error) -> Self {
        FlavorError::JsonError(err)
    }
}

impl From<anyhow::Error> for FlavorError {
    fn from(err: anyhow::Error) -> Self {
        FlavorError::Generic(err.to_string())
    }
}

/// Result type for flavorpack operations
pub type Result<T> = std::result::Result<T, FlavorError>;
