//! Ephemeral ECDH over P-256
//!
//! Each handshake generates a fresh ephemeral keypair. The raw x-coordinate
//! of the shared point feeds the session key derivation.

use p256::{PublicKey, SecretKey, elliptic_curve::sec1::ToEncodedPoint};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

/// Length of an encoded ephemeral public key (uncompressed SEC1 point).
pub const EPHEMERAL_PUBLIC_KEY_SIZE: usize = 65;

/// Ephemeral keypair for one handshake run.
///
/// Persisted (via [`EphemeralKeyPair::to_secret_bytes`]) only until the
/// handshake completes, so a retried handshake can republish the same key.
#[derive(Clone)]
pub struct EphemeralKeyPair {
    secret: SecretKey,
}

impl EphemeralKeyPair {
    /// Build a keypair from 32 caller-provided random bytes.
    pub fn from_random_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(bytes);
        let secret =
            SecretKey::from_slice(bytes.as_slice()).map_err(|_| CryptoError::InvalidScalar)?;
        Ok(Self { secret })
    }

    /// Restore a persisted keypair.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength { expected: 32, actual: bytes.len() });
        }
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidScalar)?;
        Ok(Self { secret })
    }

    /// Private scalar for short-lived persistence. Zeroized when dropped.
    pub fn to_secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&self.secret.to_bytes());
        out
    }

    /// Public half.
    pub fn public_key(&self) -> EphemeralPublicKey {
        EphemeralPublicKey { inner: self.secret.public_key() }
    }

    /// Compute the shared secret with a peer's ephemeral public key.
    ///
    /// Symmetric: `a.diffie_hellman(&b.public_key()) ==
    /// b.diffie_hellman(&a.public_key())`.
    pub fn diffie_hellman(&self, peer: &EphemeralPublicKey) -> SharedSecret {
        let shared =
            p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.inner.as_affine());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(shared.raw_secret_bytes());
        SharedSecret(bytes)
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair").field("public_key", &self.public_key()).finish()
    }
}

/// Public half of an ephemeral keypair.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EphemeralPublicKey {
    inner: PublicKey,
}

impl EphemeralPublicKey {
    /// Decode a SEC1 point. Points not on the curve are rejected.
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let inner = PublicKey::from_sec1_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey { kind: "ephemeral" })?;
        Ok(Self { inner })
    }

    /// Uncompressed SEC1 encoding.
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.inner.to_encoded_point(false).as_bytes().to_vec()
    }
}

impl std::fmt::Debug for EphemeralPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encoded = self.to_sec1_bytes();
        let prefix: String = encoded.iter().skip(1).take(6).map(|b| format!("{b:02x}")).collect();
        write!(f, "EphemeralPublicKey({prefix}..)")
    }
}

/// Raw ECDH output (32 bytes). Zeroized on drop.
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Raw secret bytes, input keying material for HKDF.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}
