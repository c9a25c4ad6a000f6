//! Security event log records.
//!
//! Every event is written twice: to tracing on the `parley::security` target
//! and to storage, so operators can query it later with the admin CLI.

use std::{collections::BTreeMap, fmt};

use parley_core::replay::ReplayRejection;
use serde::{Deserialize, Serialize};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventKind {
    /// A user started a file upload (logged before validation)
    FileUploadAttempt,
    /// Envelope reused a nonce already accepted from this sender
    ReplayNonceReused,
    /// Envelope sequence number did not increase
    ReplaySequenceRollback,
    /// Envelope failed structural validation
    MalformedEnvelope,
    /// A user tried to register a different identity key
    IdentityConflict,
}

impl SecurityEventKind {
    /// Stable upper-case name used in logs and JSON output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileUploadAttempt => "FILE_UPLOAD_ATTEMPT",
            Self::ReplayNonceReused => "REPLAY_NONCE_REUSED",
            Self::ReplaySequenceRollback => "REPLAY_SEQUENCE_ROLLBACK",
            Self::MalformedEnvelope => "MALFORMED_ENVELOPE",
            Self::IdentityConflict => "IDENTITY_CONFLICT",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ReplayRejection> for SecurityEventKind {
    fn from(rejection: &ReplayRejection) -> Self {
        match rejection {
            ReplayRejection::NonceReused => Self::ReplayNonceReused,
            ReplayRejection::SequenceRollback { .. } => Self::ReplaySequenceRollback,
        }
    }
}

/// One entry in the relay's security log.
///
/// Never carries key material or ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    /// Event type
    pub kind: SecurityEventKind,
    /// User the event is attributed to
    pub user_id: String,
    /// Human-readable summary
    pub message: String,
    /// Structured context (receiver, filename, nonce, sequence, ...)
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    /// Wall clock, milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl SecurityEvent {
    /// Event without details.
    pub fn new(
        kind: SecurityEventKind,
        user_id: impl Into<String>,
        message: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            message: message.into(),
            details: BTreeMap::new(),
            timestamp,
        }
    }

    /// Attach one context field.
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_owned(), value.to_string());
        self
    }
}
