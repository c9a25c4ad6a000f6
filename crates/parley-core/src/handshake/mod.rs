//! Ephemeral key exchange between two peers through the mailbox.
//!
//! [`Handshake`] is the pure state machine; [`HandshakeDriver`] runs it
//! against real collaborators. Roles are fixed by [`crate::conversation::role`]
//! so both sides agree without negotiating.

mod driver;
mod machine;
mod retry;

pub use driver::{HandshakeDriver, SessionEstablished};
pub use machine::{AnsweredInit, Handshake, HandshakeAction, HandshakeState};
pub use retry::{DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_TOTAL_DELAY, RetryPolicy};

/// Handshake configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Mailbox polling budget per attempt
    pub retry: RetryPolicy,
}
