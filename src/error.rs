//! Error types for the membrane core.
//!
//! The core uses a hierarchical error system:
//! - `MembraneError` is the top-level error returned by all public APIs
//! - Specific error types (`StorageError`, `ValidationError`, `TransportError`)
//!   provide detail
//!
//! # Propagation policy
//!
//! Write-path failures at the warm tier fail the caller. Downstream effects
//! (hot tier set, bus publish, peer replication) are best-effort: their
//! failures are logged and never surface to the originating caller.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::PeerId;

/// Result type alias for membrane operations.
pub type Result<T> = std::result::Result<T, MembraneError>;

/// Top-level error enum for all membrane operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum MembraneError {
    /// Storage layer error (I/O, corruption, transactions).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Input validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// Requested entity not found in any accessible tier.
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// Idempotency violation (e.g. mutating an immutable learning event).
    #[error("Conflict: {reason}")]
    Conflict {
        /// Description of the conflicting write.
        reason: String,
    },

    /// The request carried no authenticated principal.
    #[error("Unauthorized")]
    Unauthorized,

    /// The principal lacks the role required for this operation.
    #[error("Forbidden: requires role {required}")]
    Forbidden {
        /// The role the operation requires.
        required: String,
    },

    /// The warm tier is unreachable. Sweepers pause until recovery.
    #[error("Tier unavailable ({tier}): {reason}")]
    TierUnavailable {
        /// Which tier failed ("hot", "warm", "cold").
        tier: &'static str,
        /// Backend-reported reason.
        reason: String,
    },

    /// Deadline exceeded; outstanding tier I/O was abandoned.
    #[error("Timeout during {operation}")]
    Timeout {
        /// The operation that missed its deadline.
        operation: String,
    },

    /// Sync fabric send/receive failure. Recovered locally: the peer is
    /// marked errored, the batch requeued, and a redial scheduled.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Outbound queue above its high-water mark. Recovered locally by
    /// dropping the newest writes; never surfaced to the write caller.
    #[error("Queue overflow for peer {peer}: dropped {dropped} envelope(s)")]
    QueueOverflow {
        /// The slow peer whose queue overflowed.
        peer: PeerId,
        /// How many envelopes were dropped.
        dropped: u64,
    },

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Vector index error (HNSW operations).
    #[error("Vector index error: {0}")]
    Vector(String),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MembraneError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a conflict error with the given reason.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Creates a forbidden error naming the required role.
    pub fn forbidden(required: impl Into<String>) -> Self {
        Self::Forbidden {
            required: required.into(),
        }
    }

    /// Creates a tier-unavailable error for the named tier.
    pub fn tier_unavailable(tier: &'static str, reason: impl Into<String>) -> Self {
        Self::TierUnavailable {
            tier,
            reason: reason.into(),
        }
    }

    /// Creates a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Creates a vector index error with the given message.
    pub fn vector(msg: impl Into<String>) -> Self {
        Self::Vector(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if this is a transport error.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is a vector index error.
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Vector(_))
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the warm-tier storage layer or the
/// cold archive backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database file or data is corrupted.
    #[error("Database corrupted: {0}")]
    Corrupted(String),

    /// Database file not found at expected path.
    #[error("Database not found: {0}")]
    DatabaseNotFound(PathBuf),

    /// Database is locked by another process.
    #[error("Database is locked by another writer")]
    DatabaseLocked,

    /// Transaction failed (commit, rollback, etc.).
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error from the redb storage engine.
    #[error("Storage engine error: {0}")]
    Redb(String),

    /// Cold archive object missing or unreadable.
    #[error("Archive object error: {0}")]
    Archive(String),

    /// Database schema version doesn't match expected version.
    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version.
        expected: u32,
        /// Actual schema version found in database.
        found: u32,
    },
}

impl StorageError {
    /// Creates a corruption error with the given message.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Creates a transaction error with the given message.
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Creates a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Creates a redb error with the given message.
    pub fn redb(msg: impl Into<String>) -> Self {
        Self::Redb(msg.into())
    }

    /// Creates a cold-archive error with the given message.
    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }
}

// Conversions from redb error types
impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        StorageError::Redb(err.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Redb(err.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Transaction(err.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Transaction(format!("Commit failed: {}", err))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Redb(format!("Table error: {}", err))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::Redb(format!("Storage error: {}", err))
    }
}

// Convert bincode errors to StorageError
impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// Also allow direct conversion to MembraneError for convenience
impl From<redb::Error> for MembraneError {
    fn from(err: redb::Error) -> Self {
        MembraneError::Storage(StorageError::from(err))
    }
}

impl From<redb::DatabaseError> for MembraneError {
    fn from(err: redb::DatabaseError) -> Self {
        MembraneError::Storage(StorageError::from(err))
    }
}

impl From<redb::TransactionError> for MembraneError {
    fn from(err: redb::TransactionError) -> Self {
        MembraneError::Storage(StorageError::from(err))
    }
}

impl From<redb::CommitError> for MembraneError {
    fn from(err: redb::CommitError) -> Self {
        MembraneError::Storage(StorageError::from(err))
    }
}

impl From<redb::TableError> for MembraneError {
    fn from(err: redb::TableError) -> Self {
        MembraneError::Storage(StorageError::from(err))
    }
}

impl From<redb::StorageError> for MembraneError {
    fn from(err: redb::StorageError) -> Self {
        MembraneError::Storage(StorageError::from(err))
    }
}

impl From<bincode::Error> for MembraneError {
    fn from(err: bincode::Error) -> Self {
        MembraneError::Storage(StorageError::from(err))
    }
}

/// Validation errors for input data.
///
/// These errors indicate problems with data provided by the caller.
/// Never retried by the core.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Embedding dimension doesn't match the configured dimension.
    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected dimension from configuration.
        expected: usize,
        /// Actual dimension provided.
        got: usize,
    },

    /// A field has an invalid value.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the invalid field.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// A required field is missing or empty.
    #[error("Required field missing: {field}")]
    RequiredField {
        /// Name of the missing field.
        field: String,
    },

    /// Payload exceeds maximum allowed size.
    #[error("Payload too large: {size} bytes (max: {max} bytes)")]
    PayloadTooLarge {
        /// Actual payload size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Too many items in a collection field.
    #[error("Too many items in '{field}': {count} (max: {max})")]
    TooManyItems {
        /// Name of the field.
        field: String,
        /// Actual count.
        count: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// Input carried a field the schema does not declare.
    #[error("Unknown field: {field}")]
    UnknownField {
        /// Name of the unexpected field.
        field: String,
    },
}

impl ValidationError {
    /// Creates a dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, got: usize) -> Self {
        Self::DimensionMismatch { expected, got }
    }

    /// Creates an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a required field error.
    pub fn required_field(field: impl Into<String>) -> Self {
        Self::RequiredField {
            field: field.into(),
        }
    }

    /// Creates a payload too large error.
    pub fn payload_too_large(size: usize, max: usize) -> Self {
        Self::PayloadTooLarge { size, max }
    }

    /// Creates a too many items error.
    pub fn too_many_items(field: impl Into<String>, count: usize, max: usize) -> Self {
        Self::TooManyItems {
            field: field.into(),
            count,
            max,
        }
    }

    /// Creates an unknown field error.
    pub fn unknown_field(field: impl Into<String>) -> Self {
        Self::UnknownField {
            field: field.into(),
        }
    }
}

/// Not found errors for specific entity types.
#[derive(Debug, Error)]
pub enum NotFoundError {
    /// Memory entry with given ID not found in any tier.
    #[error("Memory entry not found: {0}")]
    Memory(String),

    /// Learning event with given ID not found.
    #[error("Learning event not found: {0}")]
    Event(String),

    /// Insight with given ID not found.
    #[error("Insight not found: {0}")]
    Insight(String),

    /// Peer with given ID not configured.
    #[error("Peer not found: {0}")]
    Peer(String),
}

impl NotFoundError {
    /// Creates a memory-entry not found error.
    pub fn memory(id: impl ToString) -> Self {
        Self::Memory(id.to_string())
    }

    /// Creates a learning-event not found error.
    pub fn event(id: impl ToString) -> Self {
        Self::Event(id.to_string())
    }

    /// Creates an insight not found error.
    pub fn insight(id: impl ToString) -> Self {
        Self::Insight(id.to_string())
    }

    /// Creates a peer not found error.
    pub fn peer(id: impl ToString) -> Self {
        Self::Peer(id.to_string())
    }
}

/// Transport errors raised inside the sync fabric.
///
/// Always recovered locally; never propagated to write callers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing a peer endpoint failed.
    #[error("Connect to {endpoint} failed: {reason}")]
    Connect {
        /// The endpoint that refused the connection.
        endpoint: String,
        /// Backend-reported reason.
        reason: String,
    },

    /// Sending a frame on an established connection failed.
    #[error("Send to peer {peer} failed: {reason}")]
    Send {
        /// The peer whose connection broke.
        peer: PeerId,
        /// Backend-reported reason.
        reason: String,
    },

    /// A received frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A peer sent envelopes before completing the identify handshake.
    #[error("Frame received before identify from {0}")]
    NotIdentified(String),

    /// The connection closed mid-stream.
    #[error("Connection to peer {peer} closed")]
    Closed {
        /// The peer whose connection closed.
        peer: PeerId,
    },
}

impl TransportError {
    /// Creates a connect error.
    pub fn connect(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Creates a send error.
    pub fn send(peer: PeerId, reason: impl Into<String>) -> Self {
        Self::Send {
            peer,
            reason: reason.into(),
        }
    }

    /// Creates a malformed-frame error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MembraneError::config("missing warm tier path");
        assert_eq!(
            err.to_string(),
            "Configuration error: missing warm tier path"
        );
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::SchemaVersionMismatch {
            expected: 2,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "Schema version mismatch: expected 2, found 1"
        );
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::dimension_mismatch(384, 768);
        assert_eq!(
            err.to_string(),
            "Embedding dimension mismatch: expected 384, got 768"
        );
    }

    #[test]
    fn test_not_found_error_display() {
        let err = NotFoundError::memory("abc-123");
        assert_eq!(err.to_string(), "Memory entry not found: abc-123");
    }

    #[test]
    fn test_is_not_found() {
        let err: MembraneError = NotFoundError::memory("test").into();
        assert!(err.is_not_found());
        assert!(!err.is_validation());
    }

    #[test]
    fn test_is_validation() {
        let err: MembraneError = ValidationError::required_field("domain").into();
        assert!(err.is_validation());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_is_conflict() {
        let err = MembraneError::conflict("learning events are immutable");
        assert!(err.is_conflict());
        assert!(!err.is_storage());
    }

    #[test]
    fn test_transport_error_display() {
        let err: MembraneError =
            TransportError::send(PeerId::new("dspy"), "broken pipe").into();
        assert_eq!(
            err.to_string(),
            "Transport error: Send to peer dspy failed: broken pipe"
        );
        assert!(err.is_transport());
    }

    #[test]
    fn test_queue_overflow_display() {
        let err = MembraneError::QueueOverflow {
            peer: PeerId::new("lora"),
            dropped: 3,
        };
        assert_eq!(
            err.to_string(),
            "Queue overflow for peer lora: dropped 3 envelope(s)"
        );
    }

    #[test]
    fn test_error_conversion_chain() {
        // Simulate a storage error propagating up
        fn inner() -> Result<()> {
            Err(StorageError::corrupted("test corruption"))?
        }

        let result = inner();
        assert!(result.is_err());
        assert!(result.unwrap_err().is_storage());
    }
}
