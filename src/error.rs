//! Error types for s3packer
//!
//! Every failure is fatal to the run that raised it. The variants name the
//! operation that failed so callers can report it without parsing messages:
//! - Location and destination errors are raised before any I/O starts
//! - Stage errors (listing, retrieval, archive, upload, local I/O) carry the
//!   object or path involved plus the collaborator's cause
//! - [`Error::Cancelled`] marks stages that stopped because another stage failed
//!   or the caller cancelled the run

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for s3packer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for s3packer
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed location string, or a source that is not a remote object location
    #[error("invalid location '{location}': {reason}")]
    InvalidLocation {
        /// The location string as given
        location: String,
        /// Why it was rejected
        reason: String,
    },

    /// Destination uses a scheme no sink can write to
    #[error("unsupported destination '{location}': unknown scheme '{scheme}'")]
    UnsupportedDestination {
        /// The destination string as given
        location: String,
        /// The unrecognized scheme
        scheme: String,
    },

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "part_size")
        key: Option<String>,
    },

    /// Paged enumeration of a prefix failed
    #[error("listing s3://{bucket}/{prefix} failed: {source}")]
    Listing {
        /// Bucket being listed
        bucket: String,
        /// Prefix being listed
        prefix: String,
        /// Underlying store failure
        source: StoreError,
    },

    /// Fetching an object's content failed
    #[error("retrieving s3://{bucket}/{key} failed: {source}")]
    Retrieval {
        /// Bucket of the object
        bucket: String,
        /// Key of the object
        key: String,
        /// Underlying store failure
        source: StoreError,
    },

    /// Fetched bytes do not match the checksum reported by the listing
    #[error("checksum mismatch for s3://{bucket}/{key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Bucket of the object
        bucket: String,
        /// Key of the object
        key: String,
        /// MD5 reported by the store
        expected: String,
        /// MD5 of the bytes received
        actual: String,
    },

    /// Compressing an entry or finalizing the archive failed
    #[error("writing archive entry '{entry}' failed: {reason}")]
    ArchiveWrite {
        /// Entry being written (empty while writing the trailer)
        entry: String,
        /// The reason the write failed
        reason: String,
    },

    /// Streaming upload to the remote destination failed
    #[error("uploading to s3://{bucket}/{key} failed: {source}")]
    Upload {
        /// Destination bucket
        bucket: String,
        /// Destination key
        key: String,
        /// Underlying store failure
        source: StoreError,
    },

    /// Writing the local destination file failed
    #[error("writing {path} failed: {source}")]
    LocalIo {
        /// Destination path
        path: PathBuf,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// The run was cancelled before completion
    #[error("pack cancelled")]
    Cancelled,

    /// A stage task panicked or was aborted
    #[error("{stage} stage terminated unexpectedly: {reason}")]
    StageTerminated {
        /// Stage whose task ended abnormally
        stage: Stage,
        /// Panic or abort message
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be constructed
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Failures reported by an [`ObjectStore`](crate::store::ObjectStore) implementation
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object or bucket does not exist
    #[error("not found")]
    NotFound,

    /// Store answered with a non-success status
    #[error("unexpected HTTP status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Store response could not be decoded
    #[error("malformed response: {0}")]
    Parse(String),

    /// Request never produced a response
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other collaborator failure
    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

/// Pipeline stage an error originated from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Location parsing and configuration checks, before any I/O
    Setup,
    /// Recursive listing and deduplication
    Traversal,
    /// Object retrieval
    Fetch,
    /// Zip encoding
    Archive,
    /// Upload or local file write
    Sink,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::Traversal => "traversal",
            Stage::Fetch => "fetch",
            Stage::Archive => "archive",
            Stage::Sink => "sink",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Create a configuration error for a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Create an invalid-location error
    pub fn invalid_location(location: &str, reason: impl Into<String>) -> Self {
        Error::InvalidLocation {
            location: location.to_string(),
            reason: reason.into(),
        }
    }

    /// Pipeline stage this error belongs to, `None` for cancellation
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::InvalidLocation { .. }
            | Error::UnsupportedDestination { .. }
            | Error::Config { .. }
            | Error::Network(_) => Some(Stage::Setup),
            Error::Listing { .. } => Some(Stage::Traversal),
            Error::Retrieval { .. } | Error::ChecksumMismatch { .. } => Some(Stage::Fetch),
            Error::ArchiveWrite { .. } => Some(Stage::Archive),
            Error::Upload { .. } | Error::LocalIo { .. } | Error::Io(_) => Some(Stage::Sink),
            Error::StageTerminated { stage, .. } => Some(*stage),
            Error::Cancelled => None,
        }
    }

    /// Returns true if this error only records that the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
