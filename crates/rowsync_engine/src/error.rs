//! Error types for the sync engine.

use rowsync_protocol::{ProtocolError, RowId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while mirroring a table.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A remote call failed.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A push payload or condition could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A backup was released that the write log does not hold.
    ///
    /// This is a logic defect in the caller, never a runtime condition.
    #[error("no active backup for row {id}")]
    BackupInvariant {
        /// Identity of the row.
        id: RowId,
    },

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The table has been closed.
    #[error("table is closed")]
    TableClosed,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport { retryable: true, .. })
    }

    /// Returns true if this error came from a remote call.
    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::Transport { .. })
    }
}
