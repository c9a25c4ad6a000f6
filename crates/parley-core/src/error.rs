//! Error types for the Parley protocol core.
//!
//! One enum per concern. Every error that can end a handshake or a decrypt
//! maps onto an [`ErrorClass`], which decides whether callers retry, skip,
//! or surface the failure as a security event.

use std::time::Duration;

use parley_crypto::CryptoError;
use parley_proto::HandshakeKind;
use thiserror::Error;

use crate::{handshake::HandshakeState, replay::ReplayRejection};

/// How a failure must be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Forged or replayed input. Never retried automatically; logged as a
    /// security event.
    SecurityViolation,
    /// AEAD tag did not verify. The message is skipped as undecryptable.
    AuthenticationFailure,
    /// Handshake polling ran out of attempts or time. The caller may start
    /// over.
    Exhausted,
    /// A required precondition does not hold (missing identity, no session,
    /// wrong state). Fix the setup, then retry.
    Precondition,
    /// Infrastructure failure (storage, mailbox). Safe to retry.
    Transient,
}

/// Errors from the local key-value store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend I/O or transaction failure
    #[error("store backend failure: {0}")]
    Backend(String),

    /// Stored value could not be decoded
    #[error("corrupt {what}: {reason}")]
    Corrupt {
        /// What was being decoded
        what: &'static str,
        /// Decoder message
        reason: String,
    },
}

/// Errors from [`crate::identity::IdentityKeyStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// No identity key exists for this user
    ///
    /// Precondition failure for every handshake operation, not a retry case.
    #[error("no identity key for user {user_id}")]
    NotFound {
        /// User that was looked up
        user_id: String,
    },

    /// Stored key material is unusable
    #[error("stored identity key is invalid: {0}")]
    InvalidKey(#[from] CryptoError),

    /// Underlying store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from a [`crate::mailbox::Mailbox`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// Mailbox could not be reached or failed internally
    #[error("mailbox unavailable: {0}")]
    Unavailable(String),

    /// Mailbox refused the record
    #[error("mailbox rejected record: {0}")]
    Rejected(String),
}

/// Errors from a [`crate::mailbox::MessageTransport`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport could not be reached or failed internally
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Envelope failed validation at the relay
    #[error("envelope rejected: {0}")]
    Rejected(String),

    /// Relay replay guard refused the envelope
    #[error("replay rejected: {0}")]
    Replay(ReplayRejection),
}

impl TransportError {
    /// Returns true if the relay flagged this envelope as a replay.
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::Replay(_))
    }
}

/// Errors that end a handshake attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Own identity key is missing
    #[error("no identity key for user {user_id}")]
    IdentityNotFound {
        /// User whose key is missing
        user_id: String,
    },

    /// Handshake record signature did not verify against its embedded key
    #[error("invalid signature on {kind} record from {peer}")]
    InvalidSignature {
        /// Claimed sender
        peer: String,
        /// Record type
        kind: HandshakeKind,
    },

    /// Record is signed by a key other than the one pinned for this peer
    #[error("identity key for {peer} does not match pinned key")]
    IdentityMismatch {
        /// Peer whose key changed
        peer: String,
    },

    /// Mailbox returned a record for a different sender, recipient or type
    #[error("unexpected {kind} record: expected {expected}")]
    UnexpectedRecord {
        /// Record type received
        kind: HandshakeKind,
        /// What the state machine was waiting for
        expected: String,
    },

    /// Signed record carries key bytes that are not valid P-256 points
    #[error("malformed {field} in record from {peer}")]
    MalformedKey {
        /// Claimed sender
        peer: String,
        /// Offending field
        field: &'static str,
    },

    /// Polling exhausted its attempt or delay budget
    #[error("peer {peer} unresponsive after {attempts} attempts ({waited:?})")]
    Exhausted {
        /// Peer that never answered
        peer: String,
        /// Fetches performed
        attempts: u32,
        /// Cumulative backoff delay
        waited: Duration,
    },

    /// Operation called in the wrong state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state
        state: HandshakeState,
        /// Attempted operation
        operation: &'static str,
    },

    /// Both participants have the same id
    #[error("cannot open a session with self ({user_id})")]
    SelfConversation {
        /// The duplicated id
        user_id: String,
    },

    /// Mailbox failure during publish or fetch
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    /// Local store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HandshakeError {
    /// Classification used for retry and logging decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidSignature { .. }
            | Self::IdentityMismatch { .. }
            | Self::UnexpectedRecord { .. }
            | Self::MalformedKey { .. } => ErrorClass::SecurityViolation,

            Self::Exhausted { .. } => ErrorClass::Exhausted,

            Self::IdentityNotFound { .. }
            | Self::InvalidState { .. }
            | Self::SelfConversation { .. } => ErrorClass::Precondition,

            Self::Mailbox(_) | Self::Store(_) => ErrorClass::Transient,
        }
    }

    /// Returns true if this error is a possible attack and must abort.
    pub fn is_security_violation(&self) -> bool {
        self.class() == ErrorClass::SecurityViolation
    }

    /// Returns true if the caller may start a fresh attempt.
    ///
    /// The state machine itself never retries after returning an error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Exhausted | ErrorClass::Transient)
    }
}

impl From<IdentityError> for HandshakeError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::NotFound { user_id } => Self::IdentityNotFound { user_id },
            IdentityError::InvalidKey(err) => {
                Self::Store(StoreError::Corrupt { what: "identity key", reason: err.to_string() })
            },
            IdentityError::Store(err) => Self::Store(err),
        }
    }
}

/// Errors from sealing or opening envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// No session key exists for this conversation
    #[error("no session for conversation {conversation_id}")]
    NoSession {
        /// Conversation that was looked up
        conversation_id: String,
    },

    /// Neither the current key nor the declared version decrypted the
    /// envelope
    #[error("envelope {sequence_number} (key version {key_version}) is undecryptable")]
    Undecryptable {
        /// Version the sender declared
        key_version: u32,
        /// Sender's sequence number
        sequence_number: u64,
    },

    /// Envelope participants do not match the conversation
    #[error("envelope from {sender_id} to {receiver_id} is not part of {conversation_id}")]
    WrongConversation {
        /// Envelope sender
        sender_id: String,
        /// Envelope receiver
        receiver_id: String,
        /// Conversation being opened
        conversation_id: String,
    },

    /// Local store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EnvelopeError {
    /// Classification used for skip-and-continue decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Undecryptable { .. } => ErrorClass::AuthenticationFailure,
            Self::WrongConversation { .. } => ErrorClass::SecurityViolation,
            Self::NoSession { .. } => ErrorClass::Precondition,
            Self::Store(_) => ErrorClass::Transient,
        }
    }

    /// Returns true if a batch decrypt may skip this item and continue.
    pub fn is_skippable(&self) -> bool {
        matches!(self.class(), ErrorClass::AuthenticationFailure | ErrorClass::SecurityViolation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failures_are_security_violations() {
        let err = HandshakeError::InvalidSignature { peer: "b2".into(), kind: HandshakeKind::Init };
        assert!(err.is_security_violation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn exhaustion_is_retryable_by_caller() {
        let err = HandshakeError::Exhausted {
            peer: "b2".into(),
            attempts: 8,
            waited: Duration::from_secs(30),
        };
        assert_eq!(err.class(), ErrorClass::Exhausted);
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_identity_is_precondition() {
        let err: HandshakeError = IdentityError::NotFound { user_id: "a1".into() }.into();
        assert_eq!(err, HandshakeError::IdentityNotFound { user_id: "a1".into() });
        assert_eq!(err.class(), ErrorClass::Precondition);
        assert!(!err.is_retryable());
    }

    #[test]
    fn undecryptable_is_skippable() {
        let err = EnvelopeError::Undecryptable { key_version: 2, sequence_number: 9 };
        assert!(err.is_skippable());
        assert!(!EnvelopeError::NoSession { conversation_id: "a1_b2".into() }.is_skippable());
    }

    #[test]
    fn error_display() {
        let err = HandshakeError::IdentityMismatch { peer: "b2".into() };
        assert_eq!(err.to_string(), "identity key for b2 does not match pinned key");
    }
}
