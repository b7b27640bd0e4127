//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not match any message shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Topic string is neither an aggregate name nor an entity id.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// A well-formed frame arrived where the session did not allow it.
    #[error("unexpected '{got}' frame, expected '{expected}'")]
    UnexpectedMessage {
        /// Frame type the session was waiting for.
        expected: &'static str,
        /// Frame type that arrived.
        got: &'static str,
    },
}

/// Reasons a patch or create request is refused before touching any state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The patch contains no fields.
    #[error("patch is empty")]
    EmptyPatch,

    /// The field does not exist on this kind of entity.
    #[error("unknown field '{field}'")]
    UnknownField {
        /// Offending field name.
        field: String,
    },

    /// The field exists but can never be changed by a patch.
    #[error("field '{field}' is immutable")]
    ImmutableField {
        /// Offending field name.
        field: String,
    },

    /// A required field was absent on create.
    #[error("missing required field '{field}'")]
    MissingField {
        /// Missing field name.
        field: String,
    },

    /// The value has the wrong type or is out of range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Offending field name.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A task patch was applied to a lane or vice versa.
    #[error("patch kind does not match entity kind")]
    KindMismatch,
}

impl ValidationError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = ValidationError::invalid("status", "unknown status 'archived'");
        assert_eq!(
            err.to_string(),
            "invalid value for 'status': unknown status 'archived'"
        );

        let err = ValidationError::ImmutableField {
            field: "created_by".into(),
        };
        assert!(err.to_string().contains("created_by"));
    }
}
