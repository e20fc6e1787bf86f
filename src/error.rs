//! Error types for MongoDB operations.
//!
//! The variants follow the categories the execution core distinguishes:
//! transport failures, server command failures, per-document write failures,
//! write-concern failures, cursor-not-found, server-side execution timeouts
//! and local misuse. Only transport failures (and a small set of transient
//! server codes) are ever retried.

use crate::connection::ServerAddress;
use thiserror::Error;

/// Label attached by the server (or by the driver on old servers) to errors
/// that are safe to retry as a write.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";

/// Label meaning the failed attempt did not perform any write.
pub const NO_WRITES_PERFORMED: &str = "NoWritesPerformed";

/// Server code for a get-more that referenced an unknown cursor.
pub const CURSOR_NOT_FOUND_CODE: i32 = 43;

/// Server code for a command that exceeded its `maxTimeMS`.
pub const MAX_TIME_MS_EXPIRED_CODE: i32 = 50;

/// Transient server codes (host unreachable, not primary, shutdown in
/// progress, ...) that make an operation eligible for a retry.
const RETRYABLE_CODES: &[i32] = &[
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436,
];

/// Where in an attempt a transport failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// Before any byte of the command left the client (server selection,
    /// connection checkout).
    Acquisition,
    /// While the command was being sent or its reply awaited.
    Transmission,
}

/// All errors that can occur during MongoDB operations.
#[derive(Debug, Clone, Error)]
pub enum MongoError {
    /// Socket or connection failure.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Stage of the attempt at which the failure happened.
        stage: FailureStage,
    },

    /// The server rejected the command.
    #[error("command error {code} ({code_name}): {message}")]
    Command {
        /// Error code from server.
        code: i32,
        /// Symbolic code name from server, empty if absent.
        code_name: String,
        /// Error message.
        message: String,
        /// Error labels attached by the server.
        labels: Vec<String>,
    },

    /// A single document of a write command failed.
    #[error("write error at index {index}: {message}")]
    Write {
        /// Index of the failed request within the bulk.
        index: usize,
        /// Error code from server.
        code: i32,
        /// Error message.
        message: String,
    },

    /// The write succeeded but the requested acknowledgement was not met.
    #[error("write concern error {code}: {message}")]
    WriteConcern {
        /// Error code from server.
        code: i32,
        /// Error message.
        message: String,
    },

    /// A get-more referenced a cursor the server no longer holds.
    #[error("cursor {cursor_id} not found on server {address}")]
    CursorNotFound {
        /// The id of the cursor the get-more referenced.
        cursor_id: i64,
        /// The server the cursor lived on.
        address: ServerAddress,
    },

    /// Server-side deadline exceeded.
    #[error("operation exceeded time limit: {message}")]
    ExecutionTimeout {
        /// Error code from server.
        code: i32,
        /// Error message.
        message: String,
    },

    /// Local misuse, detected before any network call.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error, including documents too large to send.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A blocking call was interrupted through its interrupt handle.
    #[error("operation interrupted")]
    Interrupted,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MongoError {
    /// Create a network error raised while sending or awaiting a command.
    pub fn network(msg: impl Into<String>) -> Self {
        MongoError::Network {
            message: msg.into(),
            stage: FailureStage::Transmission,
        }
    }

    /// Create a network error raised before anything was sent.
    pub fn acquisition(msg: impl Into<String>) -> Self {
        MongoError::Network {
            message: msg.into(),
            stage: FailureStage::Acquisition,
        }
    }

    /// Create a command error.
    pub fn command(code: i32, message: impl Into<String>) -> Self {
        MongoError::Command {
            code,
            code_name: String::new(),
            message: message.into(),
            labels: Vec::new(),
        }
    }

    /// Create a write error.
    pub fn write(index: usize, code: i32, message: impl Into<String>) -> Self {
        MongoError::Write {
            index,
            code,
            message: message.into(),
        }
    }

    /// Create an illegal state error.
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        MongoError::IllegalState(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        MongoError::InvalidArgument(msg.into())
    }

    /// Check if this is a transport failure.
    pub fn is_network_error(&self) -> bool {
        matches!(self, MongoError::Network { .. })
    }

    /// Check if this failure happened before any byte was sent.
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(
            self,
            MongoError::Network {
                stage: FailureStage::Acquisition,
                ..
            }
        )
    }

    /// Check if this is a server-side execution timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MongoError::ExecutionTimeout { .. })
    }

    /// Check if the error carries the given label.
    pub fn has_label(&self, label: &str) -> bool {
        match self {
            MongoError::Command { labels, .. } => labels.iter().any(|l| l == label),
            _ => false,
        }
    }

    /// Whether a read that failed with this error may be attempted again.
    pub fn is_retryable_read(&self) -> bool {
        match self {
            MongoError::Network { .. } => true,
            MongoError::Command { code, .. } => RETRYABLE_CODES.contains(code),
            _ => false,
        }
    }

    /// Whether a write that failed with this error may be attempted again.
    ///
    /// Write-concern errors and per-document write errors are never retried.
    pub fn is_retryable_write(&self) -> bool {
        match self {
            MongoError::Network { .. } => true,
            MongoError::Command { code, .. } => {
                self.has_label(RETRYABLE_WRITE_ERROR) || RETRYABLE_CODES.contains(code)
            }
            _ => false,
        }
    }

    /// Get the error code if available.
    pub fn code(&self) -> Option<i32> {
        match self {
            MongoError::Command { code, .. }
            | MongoError::Write { code, .. }
            | MongoError::WriteConcern { code, .. }
            | MongoError::ExecutionTimeout { code, .. } => Some(*code),
            MongoError::CursorNotFound { .. } => Some(CURSOR_NOT_FOUND_CODE),
            _ => None,
        }
    }

    /// Get the error message.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl From<serde_json::Error> for MongoError {
    fn from(err: serde_json::Error) -> Self {
        MongoError::Serialization(err.to_string())
    }
}

impl From<bson::ser::Error> for MongoError {
    fn from(err: bson::ser::Error) -> Self {
        MongoError::Serialization(err.to_string())
    }
}

impl From<bson::de::Error> for MongoError {
    fn from(err: bson::de::Error) -> Self {
        MongoError::Deserialization(err.to_string())
    }
}

/// Result type alias for MongoDB operations.
pub type Result<T> = std::result::Result<T, MongoError>;

/// Error kind enumeration for pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport error.
    Network,
    /// Command error.
    Command,
    /// Write error.
    Write,
    /// Write concern error.
    WriteConcern,
    /// Cursor not found.
    CursorNotFound,
    /// Server-side execution timeout.
    ExecutionTimeout,
    /// Local misuse.
    IllegalState,
    /// Invalid argument.
    InvalidArgument,
    /// Serialization error.
    Serialization,
    /// Interrupted blocking call.
    Interrupted,
    /// Internal error.
    Internal,
}

impl MongoError {
    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MongoError::Network { .. } => ErrorKind::Network,
            MongoError::Command { .. } => ErrorKind::Command,
            MongoError::Write { .. } => ErrorKind::Write,
            MongoError::WriteConcern { .. } => ErrorKind::WriteConcern,
            MongoError::CursorNotFound { .. } => ErrorKind::CursorNotFound,
            MongoError::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            MongoError::IllegalState(_) => ErrorKind::IllegalState,
            MongoError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MongoError::Serialization(_) | MongoError::Deserialization(_) => {
                ErrorKind::Serialization
            }
            MongoError::Interrupted => ErrorKind::Interrupted,
            MongoError::Internal(_) => ErrorKind::Internal,
        }
    }
}
