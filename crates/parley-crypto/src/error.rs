//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from cryptographic primitives
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Random bytes did not form a valid P-256 scalar (zero or >= curve order)
    ///
    /// Happens with negligible probability for real entropy; callers draw
    /// fresh bytes and try again.
    #[error("random bytes are not a valid P-256 scalar")]
    InvalidScalar,

    /// Encoded public key is not a valid SEC1 point on P-256
    #[error("invalid {kind} public key encoding")]
    InvalidPublicKey {
        /// Which key family was being decoded
        kind: &'static str,
    },

    /// Signature bytes are not a valid fixed-size ECDSA signature
    #[error("invalid signature encoding: expected {expected} bytes, got {actual}")]
    InvalidSignature {
        /// Expected signature length
        expected: usize,
        /// Actual signature length
        actual: usize,
    },

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// AEAD tag did not verify: wrong key, or ciphertext/IV/associated data
    /// was modified
    #[error("authentication failed")]
    AuthenticationFailed,
}

impl CryptoError {
    /// Returns true if this error means the data itself was forged or
    /// corrupted, as opposed to the caller supplying unusable entropy.
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            Self::AuthenticationFailed
            | Self::InvalidPublicKey { .. }
            | Self::InvalidSignature { .. } => true,

            Self::InvalidScalar | Self::InvalidKeyLength { .. } => false,
        }
    }
}
