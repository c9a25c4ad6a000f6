//! Message encryption using AES-256-GCM
//!
//! All functions are pure. The caller supplies the 96-bit IV from its
//! random source and any associated data that must be bound to the
//! ciphertext.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::error::CryptoError;

/// AES-GCM IV size (12 bytes)
pub const IV_SIZE: usize = 12;

/// GCM authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under `key` and `iv`, authenticating `aad`.
///
/// Returns ciphertext with the 16-byte tag appended.
///
/// # Security
///
/// - Reusing an IV under the same key breaks confidentiality; callers draw a
///   fresh random IV for every message
/// - `aad` is authenticated but not encrypted
pub fn seal(key: &[u8; 32], iv: &[u8; IV_SIZE], plaintext: &[u8], aad: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(&Key::<Aes256Gcm>::from(*key));

    let Ok(ciphertext) = cipher.encrypt(&Nonce::from(*iv), Payload { msg: plaintext, aad }) else {
        unreachable!("AES-256-GCM encryption cannot fail for in-memory inputs");
    };

    ciphertext
}

/// Decrypt and authenticate `ciphertext`.
///
/// # Errors
///
/// - `AuthenticationFailed` if the key is wrong or any of ciphertext, IV or
///   associated data was modified. The cause is not distinguished.
pub fn open(
    key: &[u8; 32],
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::AuthenticationFailed);
    }

    let cipher = Aes256Gcm::new(&Key::<Aes256Gcm>::from(*key));
    cipher
        .decrypt(&Nonce::from(*iv), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];
    const IV: [u8; IV_SIZE] = [7; IV_SIZE];

    #[test]
    fn seal_open_roundtrip() {
        let ciphertext = seal(&KEY, &IV, b"hello", b"header");
        assert_eq!(ciphertext.len(), 5 + TAG_SIZE);

        let plaintext = open(&KEY, &IV, &ciphertext, b"header").unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn empty_plaintext_is_allowed() {
        let ciphertext = seal(&KEY, &IV, b"", b"");
        assert_eq!(ciphertext.len(), TAG_SIZE);
        assert!(open(&KEY, &IV, &ciphertext, b"").unwrap().is_empty());
    }

    #[test]
    fn wrong_key_fails() {
        let ciphertext = seal(&KEY, &IV, b"hello", b"");
        let result = open(&[0x43; 32], &IV, &ciphertext, b"");
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn wrong_iv_fails() {
        let ciphertext = seal(&KEY, &IV, b"hello", b"");
        let result = open(&KEY, &[8; IV_SIZE], &ciphertext, b"");
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut ciphertext = seal(&KEY, &IV, b"hello", b"");
        ciphertext[0] ^= 0x01;
        assert_eq!(open(&KEY, &IV, &ciphertext, b""), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn tampered_aad_fails() {
        let ciphertext = seal(&KEY, &IV, b"hello", b"seq=1");
        assert_eq!(
            open(&KEY, &IV, &ciphertext, b"seq=2"),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn truncated_ciphertext_fails() {
        assert_eq!(open(&KEY, &IV, &[0u8; 8], b""), Err(CryptoError::AuthenticationFailed));
    }
}
