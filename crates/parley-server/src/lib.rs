//! Parley relay.
//!
//! The relay is the untrusted middle of the protocol: clients exchange signed
//! handshake records through its mailbox and store encrypted envelopes in its
//! log. It never holds a key that decrypts anything.
//!
//! # Components
//!
//! - [`Relay`]: mailbox, identity directory, envelope log, replay admission
//! - [`Storage`]: persistence seam, with [`MemoryStorage`] for tests and
//!   [`RedbStorage`] for durable deployments
//! - [`SecurityEvent`]: entries in the relay's security log
//! - [`SystemEnv`]: production environment (real time, OS RNG)
//!
//! [`Relay`] implements the core [`parley_core::mailbox::Mailbox`] and
//! [`parley_core::mailbox::MessageTransport`] traits, so a client can use an
//! in-process relay directly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod relay;
mod security;
pub mod storage;
mod system_env;

pub use error::RelayError;
pub use relay::{DEFAULT_NONCE_RETENTION, Relay, RelayConfig};
pub use security::{SecurityEvent, SecurityEventKind};
pub use storage::{ChaoticStorage, FaultScope, MemoryStorage, RedbStorage, Storage, StorageError};
pub use system_env::SystemEnv;
