//! Parley Client
//!
//! One user's view of Parley: identity bootstrap, session establishment and
//! rotation, and encrypted messages and files.
//!
//! # Components
//!
//! - [`Client`]: operations for one local user
//! - [`ClientConfig`]: handshake retry budget and key history size
//! - [`Conversation`]: decrypted history with a count of skipped envelopes
//!
//! The client is generic over its [`Environment`], its local
//! [`parley_core::store::KeyValueStore`] and the relay seams, so the same code
//! runs against an in-process relay under simulation.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;
mod error;
mod message;

pub use client::{Client, ClientConfig};
pub use error::ClientError;
pub use message::{Conversation, ConversationItem, DownloadedFile, MessageBody};
pub use parley_core::{Environment, SessionKey};
