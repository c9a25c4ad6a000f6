//! Long-term identity keys (ECDSA over P-256 with SHA-256)
//!
//! An identity keypair is created once per user and signs every handshake
//! record that user publishes. The public half travels inside the record
//! as an uncompressed SEC1 point (65 bytes).

use p256::ecdsa::{
    Signature, SigningKey, VerifyingKey,
    signature::{Signer, Verifier},
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Length of an encoded identity public key (uncompressed SEC1 point).
pub const IDENTITY_PUBLIC_KEY_SIZE: usize = 65;

/// Length of a fixed-size `r || s` ECDSA signature.
pub const SIGNATURE_SIZE: usize = 64;

/// A user's long-term signing keypair.
///
/// The private scalar never leaves this type except through
/// [`IdentityKeyPair::to_secret_bytes`], which hands out a zeroizing buffer
/// for persistence on the owning device.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    /// Build a keypair from 32 caller-provided random bytes.
    ///
    /// # Errors
    ///
    /// - `InvalidScalar` if the bytes are zero or not below the curve order.
    ///   Callers draw fresh bytes and retry.
    pub fn from_random_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(bytes);
        let signing =
            SigningKey::from_slice(bytes.as_slice()).map_err(|_| CryptoError::InvalidScalar)?;
        Ok(Self { signing })
    }

    /// Restore a keypair persisted with [`Self::to_secret_bytes`].
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength { expected: 32, actual: bytes.len() });
        }
        let signing = SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidScalar)?;
        Ok(Self { signing })
    }

    /// Private scalar for local persistence. Zeroized when dropped.
    pub fn to_secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&self.signing.to_bytes());
        out
    }

    /// Public half of this keypair.
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey { verifying: *self.signing.verifying_key() }
    }

    /// Sign `message` with ECDSA P-256 / SHA-256 (deterministic nonces).
    pub fn sign(&self, message: &[u8]) -> IdentitySignature {
        let signature: Signature = self.signing.sign(message);
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(&signature.to_bytes());
        IdentitySignature(bytes)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair").field("public_key", &self.public_key()).finish()
    }
}

/// Public identity key, distributed to peers and the mailbox.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IdentityPublicKey {
    verifying: VerifyingKey,
}

impl IdentityPublicKey {
    /// Decode an uncompressed (or compressed) SEC1 point.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let verifying = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey { kind: "identity" })?;
        Ok(Self { verifying })
    }

    /// Uncompressed SEC1 encoding, [`IDENTITY_PUBLIC_KEY_SIZE`] bytes.
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.verifying.to_encoded_point(false).as_bytes().to_vec()
    }

    /// Verify `signature` over `message`.
    ///
    /// Returns `false` for any mismatch. A `false` here on a handshake record
    /// is a security event, never a transient failure.
    pub fn verify(&self, message: &[u8], signature: &IdentitySignature) -> bool {
        let Ok(signature) = Signature::from_slice(&signature.0) else {
            return false;
        };
        self.verifying.verify(message, &signature).is_ok()
    }
}

impl std::fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encoded = self.to_sec1_bytes();
        let prefix: String = encoded.iter().skip(1).take(6).map(|b| format!("{b:02x}")).collect();
        write!(f, "IdentityPublicKey({prefix}..)")
    }
}

/// Fixed-size ECDSA signature (`r || s`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentitySignature(pub [u8; SIGNATURE_SIZE]);

impl IdentitySignature {
    /// Decode from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; SIGNATURE_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidSignature { expected: SIGNATURE_SIZE, actual: bytes.len() }
        })?;
        Ok(Self(array))
    }

    /// Raw `r || s` bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}
