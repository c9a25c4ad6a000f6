//! Parley wire protocol
//!
//! JSON record types exchanged between clients, the mailbox and the message
//! relay. Binary fields (keys, signatures, ciphertext, IVs) are standard
//! base64 strings; field names are camelCase.
//!
//! Two record families:
//!
//! - [`SignedHandshake`]: INIT / CONFIRM records published to the mailbox
//!   during key agreement
//! - [`EncryptedEnvelope`]: AEAD-protected messages and files sent once a
//!   session key exists
//!
//! This crate only shapes and validates bytes. Signing, verification and
//! encryption live in `parley-core` and `parley-crypto`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod b64;
pub mod envelope;
pub mod errors;
pub mod handshake;

pub use envelope::{ENVELOPE_IV_SIZE, EncryptedEnvelope, EnvelopeHeader, StoredEnvelope};
pub use errors::{ProtocolError, Result};
pub use handshake::{
    CONFIRM_SEQUENCE, HandshakeBody, HandshakeKind, HandshakePayload, INIT_SEQUENCE,
    SignedHandshake, WireHandshake,
};
