//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A push payload could not be decoded.
    #[error("malformed push payload: {message}")]
    MalformedPayload {
        /// Description of the decoding failure.
        message: String,
    },

    /// A condition could not be parsed.
    #[error("invalid condition {input:?}: {message}")]
    InvalidCondition {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        message: String,
    },

    /// A key schema was empty or listed a column twice.
    #[error("invalid key schema: {0}")]
    InvalidKeySchema(String),
}

impl ProtocolError {
    /// Creates a malformed payload error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
        }
    }

    /// Creates an invalid condition error.
    pub fn invalid_condition(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCondition {
            input: input.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::malformed("missing field `row`");
        assert_eq!(err.to_string(), "malformed push payload: missing field `row`");

        let err = ProtocolError::invalid_condition("status", "expected column:op:value");
        assert!(err.to_string().contains("status"));
        assert!(err.to_string().contains("column:op:value"));
    }
}
