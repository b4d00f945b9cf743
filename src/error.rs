//! Error types for raster block storage operations

use thiserror::Error;

/// Main error type for raster block operations
#[derive(Error, Debug)]
pub enum RasterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short {op}: expected {expected} bytes at offset {offset}, got {actual}")]
    ShortTransfer {
        op: &'static str,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Corrupt data: {0}")]
    Corruption(String),

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Not open for update: {0}")]
    ReadOnly(String),

    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Coarse classification of an error, independent of the call site.
///
/// Variants are ordered by severity so that teardown code can keep the worst
/// error seen across several flush steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// Caller passed something invalid; nothing on disk was touched
    Usage,
    /// Data may be valid but this build cannot decode it
    CodecUnavailable,
    /// Update attempted on a read-only file
    ReadOnly,
    /// A limit was detected before attempting the operation
    ResourceLimit,
    /// The underlying byte stream failed
    Io,
    /// On-disk structures cannot be trusted
    Corruption,
}

impl RasterError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RasterError::Io(_) | RasterError::ShortTransfer { .. } => ErrorKind::Io,
            RasterError::Corruption(_) | RasterError::UnsupportedVersion(_) => {
                ErrorKind::Corruption
            }
            RasterError::ResourceLimit(_) => ErrorKind::ResourceLimit,
            RasterError::ReadOnly(_) => ErrorKind::ReadOnly,
            RasterError::CodecUnavailable(_) => ErrorKind::CodecUnavailable,
            RasterError::Compression(_)
            | RasterError::InvalidDimensions(_)
            | RasterError::OutOfBounds(_)
            | RasterError::NotFound(_)
            | RasterError::Configuration(_)
            | RasterError::Serialization(_)
            | RasterError::Task(_) => ErrorKind::Usage,
        }
    }

    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        RasterError::Corruption(msg.into())
    }
}

/// Specialized Result type for raster block operations
pub type Result<T> = std::result::Result<T, RasterError>;

impl From<serde_json::Error> for RasterError {
    fn from(err: serde_json::Error) -> Self {
        RasterError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RasterError {
    fn from(err: tokio::task::JoinError) -> Self {
        RasterError::Task(err.to_string())
    }
}

/// Keeps the most severe error across a sequence of best-effort steps.
#[derive(Debug, Default)]
pub(crate) struct WorstError(Option<RasterError>);

impl WorstError {
    pub fn record<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                let replace = match &self.0 {
                    Some(current) => err.kind() > current.kind(),
                    None => true,
                };
                if replace {
                    self.0 = Some(err);
                }
                None
            }
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.0 {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
