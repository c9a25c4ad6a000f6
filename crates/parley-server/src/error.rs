//! Relay error types.

use parley_core::{ErrorClass, MailboxError, StoreError, TransportError, replay::ReplayRejection};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors returned by [`crate::Relay`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Envelope or record failed structural validation.
    ///
    /// The sender produced something no honest client would. Logged as a
    /// security event; the request is refused.
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// `envelope` or `handshake`
        what: &'static str,
        /// Which check failed
        reason: String,
    },

    /// Replay guard refused the envelope.
    #[error("replay rejected: {0}")]
    Replay(#[from] ReplayRejection),

    /// A user presented an identity key other than the registered one.
    #[error("identity key conflict for {user_id}")]
    IdentityConflict {
        /// User whose key differs
        user_id: String,
    },

    /// Identity key bytes are not a valid P-256 point.
    #[error("invalid identity key for {user_id}")]
    InvalidIdentityKey {
        /// User that attempted to register
        user_id: String,
    },

    /// No envelope with this id.
    #[error("envelope {id} not found")]
    NotFound {
        /// Requested id
        id: u64,
    },

    /// Envelope exists but carries a message, not a file.
    #[error("envelope {id} is not a file")]
    NotAFile {
        /// Requested id
        id: u64,
    },

    /// Replay state could not be loaded or persisted. Nothing was admitted.
    #[error("replay store: {0}")]
    ReplayStore(#[from] StoreError),

    /// Relay storage failed.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl RelayError {
    /// Classification used for retry and logging decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Replay(_) | Self::IdentityConflict { .. } | Self::Malformed { .. } => {
                ErrorClass::SecurityViolation
            },
            Self::InvalidIdentityKey { .. } | Self::NotFound { .. } | Self::NotAFile { .. } => {
                ErrorClass::Precondition
            },
            Self::ReplayStore(_) | Self::Storage(_) => ErrorClass::Transient,
        }
    }

    /// Returns true if the failure is infrastructure and the request may be
    /// repeated.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<RelayError> for TransportError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Replay(rejection) => Self::Replay(rejection),
            err if err.is_transient() => Self::Unavailable(err.to_string()),
            err => Self::Rejected(err.to_string()),
        }
    }
}

impl From<RelayError> for MailboxError {
    fn from(err: RelayError) -> Self {
        if err.is_transient() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Rejected(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_keeps_its_reason_across_the_seam() {
        let err = TransportError::from(RelayError::Replay(ReplayRejection::NonceReused));
        assert_eq!(err, TransportError::Replay(ReplayRejection::NonceReused));
        assert!(err.is_security_violation());
    }

    #[test]
    fn storage_failures_are_unavailable() {
        let err = TransportError::from(RelayError::Storage(StorageError::Io("disk".into())));
        assert!(matches!(err, TransportError::Unavailable(_)));

        let err = MailboxError::from(RelayError::ReplayStore(StoreError::Backend("x".into())));
        assert!(matches!(err, MailboxError::Unavailable(_)));
    }

    #[test]
    fn validation_failures_are_rejections() {
        let err = RelayError::Malformed { what: "envelope", reason: "empty nonce".into() };
        assert_eq!(err.class(), ErrorClass::SecurityViolation);
        assert!(matches!(TransportError::from(err), TransportError::Rejected(_)));
    }
}
