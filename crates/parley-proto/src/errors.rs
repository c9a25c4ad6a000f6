//! Wire decoding errors

use thiserror::Error;

/// Result alias for wire operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from decoding or validating wire records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// JSON was malformed or did not match the record shape
    #[error("malformed record: {0}")]
    Malformed(String),

    /// A CONFIRM record arrived without the initiator's ephemeral key
    #[error("{kind} record is missing {field}")]
    MissingField {
        /// Record type (`INIT` or `CONFIRM`)
        kind: &'static str,
        /// Missing wire field name
        field: &'static str,
    },

    /// An INIT record carried a field only valid on CONFIRM
    #[error("{kind} record must not carry {field}")]
    UnexpectedField {
        /// Record type
        kind: &'static str,
        /// Offending wire field name
        field: &'static str,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
