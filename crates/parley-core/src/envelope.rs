//! Envelope encryption with session keys.
//!
//! [`seal`] encrypts a message or file under the conversation's current key
//! with a fresh random IV and nonce. [`open_with_fallback`] decrypts with
//! the current key and, on failure, tries exactly one older key: the version
//! the envelope declares. [`open_batch`] applies that to a conversation
//! history and skips envelopes that cannot be opened.

use parley_crypto::{CryptoError, IV_SIZE};
use parley_proto::{EncryptedEnvelope, EnvelopeHeader, StoredEnvelope};
use tracing::{debug, warn};

use crate::{
    conversation::ConversationId,
    derivation::SessionKey,
    env::Environment,
    error::EnvelopeError,
    registry::SessionKeyRegistry,
    store::KeyValueStore,
};

/// AEAD-encrypt `plaintext` under `key` with a fresh random IV.
///
/// Returns `(ciphertext, iv)`. The ciphertext includes the 16-byte tag.
pub fn encrypt<E: Environment>(
    key: &SessionKey,
    plaintext: &[u8],
    aad: &[u8],
    env: &E,
) -> (Vec<u8>, [u8; IV_SIZE]) {
    let iv = env.random_array::<IV_SIZE>();
    let ciphertext = parley_crypto::seal(key.material(), &iv, plaintext, aad);
    (ciphertext, iv)
}

/// AEAD-decrypt `ciphertext`.
///
/// # Errors
///
/// - `AuthenticationFailed` on a wrong key or any modified byte of
///   ciphertext, IV or associated data
pub fn decrypt(
    key: &SessionKey,
    ciphertext: &[u8],
    iv: &[u8; IV_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    parley_crypto::open(key.material(), iv, ciphertext, aad)
}

/// Header fields chosen by the sender for a new envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeDraft {
    /// Sender's user id
    pub sender_id: String,
    /// Receiver's user id
    pub receiver_id: String,
    /// Sender's next sequence number
    pub sequence_number: u64,
    /// File name for file envelopes
    pub filename: Option<String>,
}

/// Encrypt `plaintext` into a complete envelope under `key`.
///
/// Generates the IV and replay nonce from `env` and stamps the wall-clock
/// time. The header is bound into the tag as associated data.
pub fn seal<E: Environment>(
    key: &SessionKey,
    draft: EnvelopeDraft,
    plaintext: &[u8],
    env: &E,
) -> EncryptedEnvelope {
    let nonce = env.random_nonce();
    let timestamp = env.wall_clock_millis();

    let aad = EnvelopeHeader {
        sender_id: &draft.sender_id,
        receiver_id: &draft.receiver_id,
        nonce: &nonce,
        sequence_number: draft.sequence_number,
        key_version: key.version(),
        timestamp,
        filename: draft.filename.as_deref(),
    }
    .associated_data();

    let (ciphertext, iv) = encrypt(key, plaintext, &aad, env);

    EncryptedEnvelope {
        sender_id: draft.sender_id,
        receiver_id: draft.receiver_id,
        ciphertext,
        iv,
        nonce,
        sequence_number: draft.sequence_number,
        key_version: key.version(),
        timestamp,
        filename: draft.filename,
    }
}

/// Decrypt `envelope` with the conversation's keys.
///
/// Tries the current key first. If that fails and the envelope declares a
/// different version, tries that version once. Historical keys are never
/// tried blindly.
///
/// # Errors
///
/// - `NoSession` if the conversation has no current key
/// - `WrongConversation` if the envelope is not between this conversation's
///   participants
/// - `Undecryptable` if neither key opens the envelope
pub fn open_with_fallback<K: KeyValueStore>(
    registry: &SessionKeyRegistry<K>,
    conversation_id: &ConversationId,
    envelope: &EncryptedEnvelope,
) -> Result<Vec<u8>, EnvelopeError> {
    if ConversationId::new(&envelope.sender_id, &envelope.receiver_id) != *conversation_id {
        return Err(EnvelopeError::WrongConversation {
            sender_id: envelope.sender_id.clone(),
            receiver_id: envelope.receiver_id.clone(),
            conversation_id: conversation_id.to_string(),
        });
    }

    let current = registry
        .current(conversation_id)?
        .ok_or_else(|| EnvelopeError::NoSession { conversation_id: conversation_id.to_string() })?;

    let aad = envelope.associated_data();
    if let Ok(plaintext) = decrypt(&current, &envelope.ciphertext, &envelope.iv, &aad) {
        return Ok(plaintext);
    }

    let undecryptable = EnvelopeError::Undecryptable {
        key_version: envelope.key_version,
        sequence_number: envelope.sequence_number,
    };

    if envelope.key_version == current.version() {
        return Err(undecryptable);
    }

    let Some(declared) = registry.by_version(conversation_id, envelope.key_version)? else {
        debug!(
            conversation_id = %conversation_id,
            key_version = envelope.key_version,
            "declared key version not retained"
        );
        return Err(undecryptable);
    };

    decrypt(&declared, &envelope.ciphertext, &envelope.iv, &aad).map_err(|_| undecryptable)
}

/// A successfully decrypted envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedEnvelope {
    /// Transport id
    pub id: u64,
    /// The envelope as stored
    pub envelope: EncryptedEnvelope,
    /// Decrypted content
    pub plaintext: Vec<u8>,
}

/// An envelope that could not be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEnvelope {
    /// Transport id
    pub id: u64,
    /// Why it was skipped
    pub reason: EnvelopeError,
}

/// Result of opening a conversation history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenedBatch {
    /// Decrypted envelopes, in input order
    pub opened: Vec<OpenedEnvelope>,
    /// Envelopes skipped as undecryptable or misaddressed
    pub skipped: Vec<SkippedEnvelope>,
}

/// Decrypt a conversation history, skipping envelopes that fail.
///
/// Per-envelope authentication failures never abort the batch: they are
/// expected after keys rotate out of history. Missing sessions and store
/// failures still propagate.
pub fn open_batch<K: KeyValueStore>(
    registry: &SessionKeyRegistry<K>,
    conversation_id: &ConversationId,
    envelopes: Vec<StoredEnvelope>,
) -> Result<OpenedBatch, EnvelopeError> {
    let mut batch = OpenedBatch::default();

    for stored in envelopes {
        match open_with_fallback(registry, conversation_id, &stored.envelope) {
            Ok(plaintext) => batch.opened.push(OpenedEnvelope {
                id: stored.id,
                envelope: stored.envelope,
                plaintext,
            }),
            Err(err) if err.is_skippable() => {
                warn!(
                    conversation_id = %conversation_id,
                    id = stored.id,
                    sender_id = %stored.envelope.sender_id,
                    key_version = stored.envelope.key_version,
                    error = %err,
                    "skipping envelope"
                );
                batch.skipped.push(SkippedEnvelope { id: stored.id, reason: err });
            },
            Err(err) => return Err(err),
        }
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryKeyValueStore, testing::TestEnv};

    fn setup() -> (TestEnv, SessionKeyRegistry<MemoryKeyValueStore>, ConversationId) {
        let env = TestEnv::new(21);
        let registry = SessionKeyRegistry::new(MemoryKeyValueStore::new(), 10);
        let cid = ConversationId::new("a1", "b2");
        (env, registry, cid)
    }

    fn draft(sequence_number: u64) -> EnvelopeDraft {
        EnvelopeDraft {
            sender_id: "a1".into(),
            receiver_id: "b2".into(),
            sequence_number,
            filename: None,
        }
    }

    fn install(registry: &SessionKeyRegistry<MemoryKeyValueStore>, cid: &ConversationId, byte: u8) -> SessionKey {
        registry.rotate(cid, &SessionKey::new(cid.clone(), 0, [byte; 32])).unwrap();
        registry.current(cid).unwrap().unwrap()
    }

    #[test]
    fn seal_then_open() {
        let (env, registry, cid) = setup();
        let key = install(&registry, &cid, 1);

        let envelope = seal(&key, draft(1), b"hello", &env);
        assert_eq!(envelope.key_version, 1);
        assert_eq!(envelope.nonce.len(), 32);
        assert_eq!(open_with_fallback(&registry, &cid, &envelope).unwrap(), b"hello");
    }

    #[test]
    fn fresh_iv_and_nonce_per_seal() {
        let (env, registry, cid) = setup();
        let key = install(&registry, &cid, 1);

        let a = seal(&key, draft(1), b"same", &env);
        let b = seal(&key, draft(2), b"same", &env);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn relabelled_header_fails() {
        let (env, registry, cid) = setup();
        let key = install(&registry, &cid, 1);

        let mut envelope = seal(&key, draft(1), b"hello", &env);
        envelope.sequence_number = 7;
        assert!(matches!(
            open_with_fallback(&registry, &cid, &envelope),
            Err(EnvelopeError::Undecryptable { .. })
        ));
    }

    #[test]
    fn falls_back_to_declared_version() {
        let (env, registry, cid) = setup();
        let old = install(&registry, &cid, 1);
        let envelope = seal(&old, draft(1), b"before rotation", &env);

        install(&registry, &cid, 2);
        assert_eq!(open_with_fallback(&registry, &cid, &envelope).unwrap(), b"before rotation");
    }

    #[test]
    fn evicted_version_is_undecryptable() {
        let env = TestEnv::new(22);
        let registry = SessionKeyRegistry::new(MemoryKeyValueStore::new(), 1);
        let cid = ConversationId::new("a1", "b2");

        let old = install(&registry, &cid, 1);
        let envelope = seal(&old, draft(1), b"lost", &env);
        install(&registry, &cid, 2);
        install(&registry, &cid, 3);

        assert_eq!(
            open_with_fallback(&registry, &cid, &envelope),
            Err(EnvelopeError::Undecryptable { key_version: 1, sequence_number: 1 })
        );
    }

    #[test]
    fn no_session_is_precondition() {
        let (env, registry, cid) = setup();
        let orphan = seal(&SessionKey::new(cid.clone(), 1, [9; 32]), draft(1), b"x", &env);
        assert!(matches!(
            open_with_fallback(&registry, &cid, &orphan),
            Err(EnvelopeError::NoSession { .. })
        ));
    }

    #[test]
    fn batch_skips_and_continues() {
        let (env, registry, cid) = setup();
        let key = install(&registry, &cid, 1);

        let good = seal(&key, draft(1), b"one", &env);
        let mut bad = seal(&key, draft(2), b"two", &env);
        bad.ciphertext[0] ^= 0xFF;
        let also_good = seal(&key, draft(3), b"three", &env);

        let batch = open_batch(
            &registry,
            &cid,
            vec![
                StoredEnvelope { id: 1, envelope: good },
                StoredEnvelope { id: 2, envelope: bad },
                StoredEnvelope { id: 3, envelope: also_good },
            ],
        )
        .unwrap();

        let texts: Vec<_> = batch.opened.iter().map(|o| o.plaintext.clone()).collect();
        assert_eq!(texts, vec![b"one".to_vec(), b"three".to_vec()]);
        assert_eq!(batch.skipped.len(), 1);
        assert_eq!(batch.skipped[0].id, 2);
    }

    #[test]
    fn misaddressed_envelope_is_skipped_in_batch() {
        let (env, registry, cid) = setup();
        let key = install(&registry, &cid, 1);
        let mut stray = seal(&key, draft(1), b"x", &env);
        stray.receiver_id = "c3".into();

        let batch = open_batch(&registry, &cid, vec![StoredEnvelope { id: 4, envelope: stray }]).unwrap();
        assert!(batch.opened.is_empty());
        assert!(matches!(batch.skipped[0].reason, EnvelopeError::WrongConversation { .. }));
    }
}
