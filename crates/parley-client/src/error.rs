//! Client error type

use parley_core::{
    EnvelopeError, ErrorClass, HandshakeError, IdentityError, StoreError, TransportError,
};
use thiserror::Error;

/// Errors returned by [`crate::Client`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Own identity key missing or unusable
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Handshake failed
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Envelope could not be sealed or opened
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Relay refused or could not be reached
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No envelope with this id
    #[error("envelope {id} not found")]
    NotFound {
        /// Requested id
        id: u64,
    },

    /// Envelope exists but carries a message, not a file
    #[error("envelope {id} is not a file")]
    NotAFile {
        /// Requested id
        id: u64,
    },
}

impl ClientError {
    /// Classification used for retry and logging decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Handshake(err) => err.class(),
            Self::Envelope(err) => err.class(),
            Self::Transport(TransportError::Replay(_)) => ErrorClass::SecurityViolation,
            Self::Transport(TransportError::Rejected(_))
            | Self::Identity(_)
            | Self::NotFound { .. }
            | Self::NotAFile { .. } => ErrorClass::Precondition,
            Self::Transport(TransportError::Unavailable(_)) | Self::Store(_) => {
                ErrorClass::Transient
            },
        }
    }

    /// Returns true if this error must be surfaced as a security event.
    pub fn is_security_violation(&self) -> bool {
        self.class() == ErrorClass::SecurityViolation
    }
}

#[cfg(test)]
mod tests {
    use parley_core::replay::ReplayRejection;

    use super::*;

    #[test]
    fn relay_replay_is_security_violation() {
        let err = ClientError::Transport(TransportError::Replay(ReplayRejection::NonceReused));
        assert!(err.is_security_violation());
    }

    #[test]
    fn handshake_class_passes_through() {
        let err = ClientError::from(HandshakeError::IdentityMismatch { peer: "b2".into() });
        assert_eq!(err.class(), ErrorClass::SecurityViolation);

        let err = ClientError::from(EnvelopeError::NoSession { conversation_id: "a1_b2".into() });
        assert_eq!(err.class(), ErrorClass::Precondition);
    }

    #[test]
    fn unavailable_relay_is_transient() {
        let err = ClientError::Transport(TransportError::Unavailable("down".into()));
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
