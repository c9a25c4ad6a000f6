//! Parley Core
//!
//! Session protocol logic: identity keys, signed handshakes, session key
//! versioning, replay admission and envelope encryption.
//!
//! # Architecture
//!
//! The handshake follows the Sans-IO action pattern. [`handshake::Handshake`]
//! takes fetched records and returns [`handshake::HandshakeAction`]s;
//! [`handshake::HandshakeDriver`] executes them against a [`mailbox::Mailbox`]
//! and a [`store::KeyValueStore`]. Everything else is synchronous and pure
//! apart from store writes.
//!
//! Time and randomness come from an [`env::Environment`], so the whole
//! protocol runs deterministically under simulation.
//!
//! # Components
//!
//! - [`identity::IdentityKeyStore`]: own signing keys and pinned peer keys
//! - [`codec`]: canonical handshake bytes, sign and verify
//! - [`handshake`]: role assignment, state machine, driver, retry policy
//! - [`derivation`]: ECDH + HKDF session key derivation
//! - [`registry::SessionKeyRegistry`]: current key plus bounded history
//! - [`replay::ReplayGuard`]: atomic per-sender nonce and sequence checks
//! - [`envelope`]: seal, open with version fallback, batch open

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod conversation;
pub mod derivation;
pub mod env;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod mailbox;
pub mod registry;
pub mod replay;
pub mod store;

pub use conversation::{ConversationId, Role, role};
pub use derivation::SessionKey;
pub use env::Environment;
pub use error::{
    EnvelopeError, ErrorClass, HandshakeError, IdentityError, MailboxError, StoreError,
    TransportError,
};
