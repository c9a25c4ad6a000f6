//! Parley Cryptographic Primitives
//!
//! Cryptographic building blocks for the parley session protocol. Pure
//! functions with deterministic outputs. Callers provide random bytes for
//! deterministic testing.
//!
//! # Key Lifecycle
//!
//! ```text
//! Identity keypair (ECDSA P-256, long-term)
//!        │ signs
//!        ▼
//! Ephemeral keypair (ECDH P-256, one per handshake)
//!        │
//!        ▼
//! ECDH shared secret ──HKDF(salt = conversation id)──▶ Session key
//!        │
//!        ▼
//! AES-256-GCM (random 96-bit IV per message) → Ciphertext
//! ```
//!
//! # Security
//!
//! Authenticity:
//! - Ephemeral keys are only trusted when carried in a record signed by the
//!   peer's identity key
//! - AES-GCM tag binds ciphertext, IV and associated data; any change is
//!   rejected
//!
//! Key separation:
//! - The conversation id salts HKDF, so two conversations never share a key
//!
//! Key hygiene:
//! - Private scalars, shared secrets and exported secret bytes are zeroized
//!   on drop

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod ecdh;
pub mod error;
pub mod identity;
pub mod kdf;

pub use aead::{IV_SIZE, TAG_SIZE, open, seal};
pub use ecdh::{EPHEMERAL_PUBLIC_KEY_SIZE, EphemeralKeyPair, EphemeralPublicKey, SharedSecret};
pub use error::CryptoError;
pub use identity::{
    IDENTITY_PUBLIC_KEY_SIZE, IdentityKeyPair, IdentityPublicKey, IdentitySignature,
    SIGNATURE_SIZE,
};
pub use kdf::derive_session_key;
