//! Error types for silt.
//!
//! silt uses a hierarchical error system:
//! - `SiltError` is the top-level error returned by all public APIs
//! - `StorageError` carries engine-level storage failures
//!
//! The core never panics across API boundaries: every fallible call returns
//! a `Result`, and scan paths additionally report read errors through a
//! non-fatal error callback (see [`crate::storage::Store::default_error_handler`]).

use thiserror::Error;

use crate::types::Uid;

/// Result type alias for silt operations.
pub type Result<T> = std::result::Result<T, SiltError>;

/// Top-level error enum for all silt operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum SiltError {
    /// Storage layer error (I/O, corruption, transactions).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A preprocessor failed; the write transaction was aborted and no
    /// revision was assigned.
    #[error("Preprocessor '{name}' failed for {uid}: {reason}")]
    PreprocessorFailed {
        /// Name of the failing preprocessor.
        name: String,
        /// Entity the command targeted.
        uid: Uid,
        /// Description of the failure.
        reason: String,
    },

    /// A command or entity payload failed schema validation.
    ///
    /// The command is dropped; ingestion of other commands continues.
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SiltError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-buffer error with the given message.
    pub fn invalid_buffer(msg: impl Into<String>) -> Self {
        Self::InvalidBuffer(msg.into())
    }

    /// Creates a preprocessor failure for the given step and entity.
    pub fn preprocessor_failed(
        name: impl Into<String>,
        uid: Uid,
        reason: impl Into<String>,
    ) -> Self {
        Self::PreprocessorFailed {
            name: name.into(),
            uid,
            reason: reason.into(),
        }
    }

    /// Returns true if this is a "not found" storage error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(StorageError::NotFound(_)))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is an invalid-buffer error.
    pub fn is_invalid_buffer(&self) -> bool {
        matches!(self, Self::InvalidBuffer(_))
    }

    /// Returns true if the error is structural and the resource should
    /// mark itself degraded rather than retry.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_fatal(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the underlying storage layer.
/// `NotFound` is local and non-fatal; `Corruption` and `Io` are fatal to
/// the resource; `MapFull` and `TxnConflict` are fatal to the current
/// transaction and retried a bounded number of times by writers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key, mapping, or named database absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store structural invariant violated.
    #[error("Database corrupted: {0}")]
    Corrupted(String),

    /// Backing file cannot grow.
    #[error("Storage map full: {0}")]
    MapFull(String),

    /// Write transaction lost a race.
    #[error("Transaction conflict: {0}")]
    TxnConflict(String),

    /// Another writer already holds the store.
    #[error("Store is locked by another writer")]
    Locked,

    /// Underlying storage I/O failed.
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Store schema version doesn't match expected version.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version.
        expected: u32,
        /// Actual schema version found in the store.
        found: u32,
    },

    /// Error from the redb storage engine that maps to no specific kind.
    #[error("Storage engine error: {0}")]
    Engine(String),
}

impl StorageError {
    /// Creates a not-found error for the given key or database name.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a corruption error with the given message.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Creates an engine error with the given message.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Returns true if this kind is retriable at the transaction level.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::TxnConflict(_) | Self::MapFull(_))
    }

    /// Returns true if this kind is fatal to the resource.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupted(_) | Self::Io(_))
    }
}

// Conversions from redb error types. redb does not distinguish a conflict
// kind (writers are serialized), so commit errors surface as TxnConflict to
// keep the retry contract in one place.
impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        StorageError::Engine(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        match err {
            redb::DatabaseError::DatabaseAlreadyOpen => StorageError::Locked,
            other => StorageError::Engine(other.to_string()),
        }
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::TxnConflict(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::TxnConflict(format!("Commit failed: {}", err))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        match err {
            redb::TableError::TableDoesNotExist(name) => StorageError::NotFound(name),
            other => StorageError::Engine(other.to_string()),
        }
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Corrupted(msg) => StorageError::Corrupted(msg),
            redb::StorageError::Io(e) => StorageError::Io(e.to_string()),
            other => StorageError::Engine(other.to_string()),
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// Also allow direct conversion to SiltError for convenience
impl From<redb::Error> for SiltError {
    fn from(err: redb::Error) -> Self {
        SiltError::Storage(StorageError::from(err))
    }
}

impl From<redb::DatabaseError> for SiltError {
    fn from(err: redb::DatabaseError) -> Self {
        SiltError::Storage(StorageError::from(err))
    }
}

impl From<redb::TransactionError> for SiltError {
    fn from(err: redb::TransactionError) -> Self {
        SiltError::Storage(StorageError::from(err))
    }
}

impl From<redb::CommitError> for SiltError {
    fn from(err: redb::CommitError) -> Self {
        SiltError::Storage(StorageError::from(err))
    }
}

impl From<redb::TableError> for SiltError {
    fn from(err: redb::TableError) -> Self {
        SiltError::Storage(StorageError::from(err))
    }
}

impl From<redb::StorageError> for SiltError {
    fn from(err: redb::StorageError) -> Self {
        SiltError::Storage(StorageError::from(err))
    }
}

impl From<bincode::Error> for SiltError {
    fn from(err: bincode::Error) -> Self {
        SiltError::Storage(StorageError::from(err))
    }
}
