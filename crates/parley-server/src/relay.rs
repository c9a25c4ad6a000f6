//! The relay: untrusted store-and-forward between clients.
//!
//! The relay holds the handshake mailbox, the identity directory, and the
//! envelope log. It never sees plaintext. What it does enforce is replay
//! admission: every envelope passes [`ReplayGuard::admit`] before it is
//! appended, so a captured envelope cannot be stored twice.
//!
//! # Security log
//!
//! File uploads, replay rejections, malformed envelopes and identity
//! conflicts are recorded as [`SecurityEvent`]s. Failure to persist an event
//! is logged and does not fail the request that triggered it.

use std::time::Duration;

use async_trait::async_trait;
use parley_core::{
    ConversationId, Environment, MailboxError, TransportError,
    mailbox::{Mailbox, MessageTransport},
    replay::{ReplayError, ReplayGuard, ReplayState},
};
use parley_crypto::{IdentityPublicKey, TAG_SIZE};
use parley_proto::{EncryptedEnvelope, HandshakeKind, SignedHandshake, StoredEnvelope};
use tracing::{debug, info, trace, warn};

use crate::{
    error::RelayError,
    security::{SecurityEvent, SecurityEventKind},
    storage::Storage,
};

/// Default window after which accepted nonces may be forgotten
pub const DEFAULT_NONCE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// How long accepted nonces are remembered. `None` keeps them forever.
    ///
    /// Pruning never lowers a sender's last sequence number, so a pruned
    /// nonce still cannot be replayed.
    pub nonce_retention: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { nonce_retention: Some(DEFAULT_NONCE_RETENTION) }
    }
}

/// Store-and-forward relay over a [`Storage`] backend.
pub struct Relay<E, S> {
    env: E,
    storage: S,
    replay: ReplayGuard<S>,
    config: RelayConfig,
}

impl<E: Environment, S: Storage> Relay<E, S> {
    /// Relay over `storage`.
    pub fn new(env: E, storage: S, config: RelayConfig) -> Self {
        Self { replay: ReplayGuard::new(storage.clone()), env, storage, config }
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Record a user's public identity key in the directory.
    ///
    /// Re-registering the same key is a no-op.
    ///
    /// # Errors
    ///
    /// - `InvalidIdentityKey` if the bytes are not a P-256 point
    /// - `IdentityConflict` if a different key is already registered
    pub fn register_identity(&self, user_id: &str, public_key: &[u8]) -> Result<(), RelayError> {
        if IdentityPublicKey::from_sec1_bytes(public_key).is_err() {
            return Err(RelayError::InvalidIdentityKey { user_id: user_id.to_owned() });
        }

        match self.storage.load_identity(user_id)? {
            Some(existing) if existing == public_key => return Ok(()),
            Some(_) => {
                self.record(SecurityEvent::new(
                    SecurityEventKind::IdentityConflict,
                    user_id,
                    format!("user {user_id} attempted to replace registered identity key"),
                    self.env.wall_clock_millis(),
                ));
                return Err(RelayError::IdentityConflict { user_id: user_id.to_owned() });
            },
            None => {},
        }

        self.storage.store_identity(user_id, public_key)?;
        info!(user_id, "identity registered");
        Ok(())
    }

    /// A user's registered public identity key.
    pub fn identity(&self, user_id: &str) -> Result<Option<Vec<u8>>, RelayError> {
        Ok(self.storage.load_identity(user_id)?)
    }

    /// Store a handshake record, replacing the previous one for its
    /// `(from, to, kind)`.
    ///
    /// The relay does not verify signatures; clients do. It does refuse a
    /// record whose embedded identity key contradicts the directory.
    pub fn publish_handshake(&self, record: SignedHandshake) -> Result<(), RelayError> {
        let body = record.payload.body();
        if body.from.is_empty() || body.to.is_empty() || body.from == body.to {
            return Err(RelayError::Malformed {
                what: "handshake",
                reason: format!("invalid participants {:?} -> {:?}", body.from, body.to),
            });
        }

        if let Some(registered) = self.storage.load_identity(&body.from)?
            && registered != body.identity_public_key
        {
            self.record(
                SecurityEvent::new(
                    SecurityEventKind::IdentityConflict,
                    &body.from,
                    format!("{} record signed with an unregistered identity key", record.kind()),
                    self.env.wall_clock_millis(),
                )
                .with_detail("to", &body.to)
                .with_detail("nonce", &body.nonce),
            );
            return Err(RelayError::IdentityConflict { user_id: body.from.clone() });
        }

        self.storage.store_handshake(&record)?;
        debug!(from = %body.from, to = %body.to, kind = %record.kind(), "handshake published");
        Ok(())
    }

    /// Latest handshake record for `(from, to, kind)`.
    pub fn fetch_handshake(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
    ) -> Result<Option<SignedHandshake>, RelayError> {
        let record = self.storage.load_handshake(from, to, kind)?;
        trace!(from, to, %kind, found = record.is_some(), "handshake fetch");
        Ok(record)
    }

    /// Admit and store a chat message envelope. Returns its id.
    ///
    /// # Errors
    ///
    /// - `Malformed` if validation fails or the envelope carries a filename
    /// - `Replay` if the nonce was used or the sequence did not increase
    pub fn send_message(&self, envelope: EncryptedEnvelope) -> Result<u64, RelayError> {
        if envelope.is_file() {
            return Err(self.malformed(&envelope, "file envelope sent as a message".into()));
        }
        self.admit(envelope)
    }

    /// Admit and store a file envelope. Returns its id.
    ///
    /// Every attempt is logged as a security event before validation.
    pub fn upload_file(&self, envelope: EncryptedEnvelope) -> Result<u64, RelayError> {
        let mut event = SecurityEvent::new(
            SecurityEventKind::FileUploadAttempt,
            &envelope.sender_id,
            format!("user {} uploading encrypted file", envelope.sender_id),
            self.env.wall_clock_millis(),
        )
        .with_detail("receiverId", &envelope.receiver_id)
        .with_detail("sequenceNumber", envelope.sequence_number)
        .with_detail("nonce", &envelope.nonce);
        if let Some(filename) = &envelope.filename {
            event = event.with_detail("filename", filename);
        }
        self.record(event);

        match envelope.filename.as_deref() {
            None | Some("") => {
                Err(self.malformed(&envelope, "file envelope without a filename".into()))
            },
            Some(_) => self.admit(envelope),
        }
    }

    /// A stored file envelope by id.
    pub fn download_file(&self, id: u64) -> Result<StoredEnvelope, RelayError> {
        let envelope = self.storage.load_envelope(id)?.ok_or(RelayError::NotFound { id })?;
        if !envelope.is_file() {
            return Err(RelayError::NotAFile { id });
        }
        Ok(StoredEnvelope { id, envelope })
    }

    /// Every envelope between `a` and `b`, in append order.
    pub fn conversation(&self, a: &str, b: &str) -> Result<Vec<StoredEnvelope>, RelayError> {
        Ok(self.storage.load_conversation(&ConversationId::new(a, b))?)
    }

    /// The most recent `limit` security events, oldest first.
    pub fn security_log(&self, limit: usize) -> Result<Vec<SecurityEvent>, RelayError> {
        Ok(self.storage.load_security_events(limit)?)
    }

    /// Replay bookkeeping for one sender.
    pub fn replay_state(&self, sender_id: &str) -> Result<Option<ReplayState>, RelayError> {
        Ok(self.replay.state(sender_id)?)
    }

    /// Periodic housekeeping: prune nonces past the configured retention.
    ///
    /// Returns the number of nonces dropped. A relay without a retention
    /// window keeps everything and returns 0.
    pub fn maintenance(&self) -> Result<usize, RelayError> {
        match self.config.nonce_retention {
            Some(retention) => self.prune_nonces_older_than(retention),
            None => Ok(0),
        }
    }

    /// Drop nonces first seen more than `age` ago, for every sender.
    pub fn prune_nonces_older_than(&self, age: Duration) -> Result<usize, RelayError> {
        let age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX);
        let cutoff_ms = self.env.wall_clock_millis().saturating_sub(age_ms);

        let pruned = self.replay.prune_nonces(cutoff_ms)?;
        if pruned > 0 {
            info!(pruned, cutoff_ms, "pruned expired nonces");
        }
        Ok(pruned)
    }

    /// Validate, replay-check and append.
    fn admit(&self, envelope: EncryptedEnvelope) -> Result<u64, RelayError> {
        if let Err(reason) = validate_envelope(&envelope) {
            return Err(self.malformed(&envelope, reason));
        }

        let now_ms = self.env.wall_clock_millis();
        match self.replay.admit(
            &envelope.sender_id,
            &envelope.nonce,
            envelope.sequence_number,
            now_ms,
        ) {
            Ok(()) => {},
            Err(ReplayError::Rejected(rejection)) => {
                self.record(
                    SecurityEvent::new(
                        SecurityEventKind::from(&rejection),
                        &envelope.sender_id,
                        format!("replay attack detected ({rejection})"),
                        now_ms,
                    )
                    .with_detail("receiverId", &envelope.receiver_id)
                    .with_detail("sequenceNumber", envelope.sequence_number)
                    .with_detail("nonce", &envelope.nonce),
                );
                return Err(rejection.into());
            },
            Err(ReplayError::Store(err)) => return Err(err.into()),
        }

        let id = self.storage.append_envelope(&envelope)?;
        debug!(
            id,
            sender_id = %envelope.sender_id,
            receiver_id = %envelope.receiver_id,
            sequence_number = envelope.sequence_number,
            key_version = envelope.key_version,
            is_file = envelope.is_file(),
            "envelope stored"
        );
        Ok(id)
    }

    fn malformed(&self, envelope: &EncryptedEnvelope, reason: String) -> RelayError {
        self.record(
            SecurityEvent::new(
                SecurityEventKind::MalformedEnvelope,
                &envelope.sender_id,
                reason.clone(),
                self.env.wall_clock_millis(),
            )
            .with_detail("receiverId", &envelope.receiver_id)
            .with_detail("sequenceNumber", envelope.sequence_number),
        );
        RelayError::Malformed { what: "envelope", reason }
    }

    /// Log to tracing and to storage. Storage failure is not propagated.
    fn record(&self, event: SecurityEvent) {
        warn!(
            target: "parley::security",
            kind = %event.kind,
            user_id = %event.user_id,
            details = ?event.details,
            "{}",
            event.message
        );

        if let Err(err) = self.storage.append_security_event(&event) {
            warn!(kind = %event.kind, error = %err, "failed to store security event");
        }
    }
}

/// Structural checks no honest client fails.
fn validate_envelope(envelope: &EncryptedEnvelope) -> Result<(), String> {
    if envelope.sender_id.is_empty() || envelope.receiver_id.is_empty() {
        return Err("missing sender or receiver".into());
    }
    if envelope.sender_id == envelope.receiver_id {
        return Err("sender and receiver are the same user".into());
    }
    if envelope.nonce.is_empty() {
        return Err("empty nonce".into());
    }
    if envelope.sequence_number == 0 {
        return Err("sequence numbers start at 1".into());
    }
    if envelope.key_version == 0 {
        return Err("key versions start at 1".into());
    }
    if envelope.ciphertext.len() < TAG_SIZE {
        return Err(format!("ciphertext shorter than the {TAG_SIZE}-byte tag"));
    }
    Ok(())
}

#[async_trait]
impl<E: Environment, S: Storage> Mailbox for Relay<E, S> {
    async fn put(&self, record: SignedHandshake) -> Result<(), MailboxError> {
        Ok(self.publish_handshake(record)?)
    }

    async fn get_latest(
        &self,
        from: &str,
        to: &str,
        kind: HandshakeKind,
    ) -> Result<Option<SignedHandshake>, MailboxError> {
        Ok(self.fetch_handshake(from, to, kind)?)
    }
}

#[async_trait]
impl<E: Environment, S: Storage> MessageTransport for Relay<E, S> {
    async fn append(&self, envelope: EncryptedEnvelope) -> Result<u64, TransportError> {
        let result = if envelope.is_file() {
            self.upload_file(envelope)
        } else {
            self.send_message(envelope)
        };
        Ok(result?)
    }

    async fn list_conversation(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Vec<StoredEnvelope>, TransportError> {
        Ok(self.conversation(a, b)?)
    }

    async fn fetch(&self, id: u64) -> Result<Option<StoredEnvelope>, TransportError> {
        let envelope = self.storage.load_envelope(id).map_err(RelayError::from)?;
        Ok(envelope.map(|envelope| StoredEnvelope { id, envelope }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use parley_core::replay::ReplayRejection;
    use parley_crypto::IdentityKeyPair;
    use parley_proto::{HandshakeBody, HandshakePayload};

    use super::*;
    use crate::storage::{ChaoticStorage, MemoryStorage};

    /// Wall clock under test control; randomness is never drawn by the relay.
    #[derive(Clone)]
    struct ManualClock {
        now_ms: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn at(now_ms: u64) -> Self {
            Self { now_ms: Arc::new(AtomicU64::new(now_ms)) }
        }

        fn advance(&self, by: Duration) {
            self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Environment for ManualClock {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
        }

        fn wall_clock_millis(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0x5A);
        }
    }

    fn relay() -> (Relay<ManualClock, MemoryStorage>, ManualClock) {
        let clock = ManualClock::at(1_700_000_000_000);
        (Relay::new(clock.clone(), MemoryStorage::new(), RelayConfig::default()), clock)
    }

    fn envelope(sender: &str, nonce: &str, sequence_number: u64) -> EncryptedEnvelope {
        EncryptedEnvelope {
            sender_id: sender.into(),
            receiver_id: if sender == "a1" { "b2".into() } else { "a1".into() },
            ciphertext: vec![0x11; 40],
            iv: [3; 12],
            nonce: nonce.into(),
            sequence_number,
            key_version: 1,
            timestamp: 1_700_000_000_000,
            filename: None,
        }
    }

    fn file(sender: &str, nonce: &str, sequence_number: u64) -> EncryptedEnvelope {
        EncryptedEnvelope {
            filename: Some("report.pdf".into()),
            ..envelope(sender, nonce, sequence_number)
        }
    }

    fn public_key(seed: u8) -> Vec<u8> {
        IdentityKeyPair::from_random_bytes([seed; 32]).unwrap().public_key().to_sec1_bytes()
    }

    fn init(from: &str, to: &str, identity_public_key: Vec<u8>) -> SignedHandshake {
        SignedHandshake {
            payload: HandshakePayload::Init(HandshakeBody {
                from: from.into(),
                to: to.into(),
                identity_public_key,
                ephemeral_public_key: vec![4; 65],
                timestamp: 1,
                nonce: "hs".into(),
                sequence: 1,
            }),
            signature: vec![0; 64],
        }
    }

    #[test]
    fn replayed_envelope_is_rejected_and_logged() {
        let (relay, _) = relay();
        let sent = envelope("a1", "n1", 1);

        assert_eq!(relay.send_message(sent.clone()).unwrap(), 1);
        assert_eq!(
            relay.send_message(sent),
            Err(RelayError::Replay(ReplayRejection::NonceReused))
        );

        let log = relay.security_log(10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, SecurityEventKind::ReplayNonceReused);
        assert_eq!(log[0].details.get("nonce").map(String::as_str), Some("n1"));
        assert_eq!(relay.conversation("b2", "a1").unwrap().len(), 1);
    }

    #[test]
    fn sequence_rollback_is_rejected() {
        let (relay, _) = relay();
        relay.send_message(envelope("a1", "n1", 5)).unwrap();

        assert_eq!(
            relay.send_message(envelope("a1", "n2", 5)),
            Err(RelayError::Replay(ReplayRejection::SequenceRollback { last: 5, got: 5 }))
        );
        assert_eq!(
            relay.security_log(1).unwrap()[0].kind,
            SecurityEventKind::ReplaySequenceRollback
        );
        // Senders are tracked independently
        relay.send_message(envelope("b2", "n1", 1)).unwrap();
    }

    #[test]
    fn malformed_envelopes_never_reach_the_replay_guard() {
        let (relay, _) = relay();

        let mut short = envelope("a1", "n1", 1);
        short.ciphertext.truncate(TAG_SIZE - 1);
        let zero_sequence = envelope("a1", "n2", 0);
        let mut to_self = envelope("a1", "n3", 1);
        to_self.receiver_id = "a1".into();

        for bad in [short, zero_sequence, to_self, envelope("a1", "", 1)] {
            assert!(matches!(relay.send_message(bad), Err(RelayError::Malformed { .. })));
        }

        assert!(relay.replay_state("a1").unwrap().is_none());
        assert_eq!(relay.security_log(10).unwrap().len(), 4);
        // The honest first envelope is still admissible
        relay.send_message(envelope("a1", "n1", 1)).unwrap();
    }

    #[test]
    fn upload_is_logged_and_served() {
        let (relay, _) = relay();
        let id = relay.upload_file(file("a1", "f1", 1)).unwrap();

        let log = relay.security_log(10).unwrap();
        assert_eq!(log[0].kind, SecurityEventKind::FileUploadAttempt);
        assert_eq!(log[0].details.get("filename").map(String::as_str), Some("report.pdf"));

        let stored = relay.download_file(id).unwrap();
        assert_eq!(stored.envelope.filename.as_deref(), Some("report.pdf"));
    }

    #[test]
    fn files_and_messages_share_the_sequence() {
        let (relay, _) = relay();
        relay.send_message(envelope("a1", "n1", 1)).unwrap();
        relay.upload_file(file("a1", "f1", 2)).unwrap();

        assert!(matches!(
            relay.upload_file(file("a1", "f2", 2)),
            Err(RelayError::Replay(ReplayRejection::SequenceRollback { .. }))
        ));
    }

    #[test]
    fn message_path_refuses_files_and_download_refuses_messages() {
        let (relay, _) = relay();
        assert!(matches!(
            relay.send_message(file("a1", "f1", 1)),
            Err(RelayError::Malformed { .. })
        ));

        let id = relay.send_message(envelope("a1", "n1", 1)).unwrap();
        assert_eq!(relay.download_file(id), Err(RelayError::NotAFile { id }));
        assert_eq!(relay.download_file(99), Err(RelayError::NotFound { id: 99 }));
    }

    #[test]
    fn identity_directory_rejects_replacement() {
        let (relay, _) = relay();
        let key = public_key(1);

        relay.register_identity("a1", &key).unwrap();
        relay.register_identity("a1", &key).unwrap();
        assert_eq!(
            relay.register_identity("a1", &public_key(2)),
            Err(RelayError::IdentityConflict { user_id: "a1".into() })
        );
        assert_eq!(relay.identity("a1").unwrap(), Some(key));

        assert_eq!(
            relay.register_identity("b2", &[4; 10]),
            Err(RelayError::InvalidIdentityKey { user_id: "b2".into() })
        );
    }

    #[test]
    fn handshake_must_match_registered_identity() {
        let (relay, _) = relay();
        relay.register_identity("a1", &public_key(1)).unwrap();

        assert!(matches!(
            relay.publish_handshake(init("a1", "b2", public_key(2))),
            Err(RelayError::IdentityConflict { .. })
        ));
        relay.publish_handshake(init("a1", "b2", public_key(1))).unwrap();

        // Unregistered senders are not checked
        relay.publish_handshake(init("c3", "b2", public_key(3))).unwrap();
        assert!(relay.fetch_handshake("a1", "b2", HandshakeKind::Init).unwrap().is_some());
    }

    #[test]
    fn handshake_to_self_is_malformed() {
        let (relay, _) = relay();
        assert!(matches!(
            relay.publish_handshake(init("a1", "a1", public_key(1))),
            Err(RelayError::Malformed { what: "handshake", .. })
        ));
    }

    #[test]
    fn maintenance_prunes_without_reopening_replays() {
        let (relay, clock) = relay();
        relay.send_message(envelope("a1", "old", 1)).unwrap();

        clock.advance(DEFAULT_NONCE_RETENTION + Duration::from_secs(1));
        relay.send_message(envelope("a1", "new", 2)).unwrap();

        assert_eq!(relay.maintenance().unwrap(), 1);
        let state = relay.replay_state("a1").unwrap().unwrap();
        assert!(!state.has_nonce("old"));
        assert!(state.has_nonce("new"));

        // The pruned nonce is still blocked by the sequence floor
        assert!(matches!(
            relay.send_message(envelope("a1", "old", 1)),
            Err(RelayError::Replay(ReplayRejection::SequenceRollback { last: 2, got: 1 }))
        ));
    }

    #[test]
    fn no_retention_keeps_everything() {
        let clock = ManualClock::at(0);
        let relay = Relay::new(
            clock.clone(),
            MemoryStorage::new(),
            RelayConfig { nonce_retention: None },
        );
        relay.send_message(envelope("a1", "n1", 1)).unwrap();
        clock.advance(Duration::from_secs(365 * 24 * 3600));

        assert_eq!(relay.maintenance().unwrap(), 0);
    }

    #[test]
    fn failed_replay_persist_admits_nothing() {
        let storage = MemoryStorage::new();
        let chaotic = ChaoticStorage::failing_writes(storage.clone(), 1.0, 9);
        let relay = Relay::new(ManualClock::at(0), chaotic, RelayConfig::default());

        let err = relay.send_message(envelope("a1", "n1", 1)).unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert_eq!(storage.envelope_count(), 0);

        // Same envelope goes through once storage recovers
        let healthy = Relay::new(ManualClock::at(0), storage.clone(), RelayConfig::default());
        assert_eq!(healthy.send_message(envelope("a1", "n1", 1)).unwrap(), 1);
    }

    #[tokio::test]
    async fn transport_seam_maps_replay() {
        let (relay, _) = relay();
        let sent = envelope("a1", "n1", 1);

        MessageTransport::append(&relay, sent.clone()).await.unwrap();
        assert_eq!(
            MessageTransport::append(&relay, sent).await,
            Err(TransportError::Replay(ReplayRejection::NonceReused))
        );
        assert!(MessageTransport::fetch(&relay, 1).await.unwrap().is_some());
        assert!(MessageTransport::fetch(&relay, 2).await.unwrap().is_none());
    }
}
