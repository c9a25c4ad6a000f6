//! Signed handshake records exchanged through the mailbox.
//!
//! A handshake is a closed two-variant type: the initiator publishes `Init`,
//! the responder answers with `Confirm`. Both carry the sender's identity key
//! and ephemeral key; `Confirm` additionally embeds the initiator's ephemeral
//! key so the initiator can tell a stale answer from the one meant for its
//! current attempt.
//!
//! # Wire shape
//!
//! ```text
//! {
//!   "type": "INIT" | "CONFIRM",
//!   "from": "a1", "to": "b2",
//!   "identityPublicKey": "<base64 SEC1>",
//!   "ephemeralPublicKey": "<base64 SEC1>",
//!   "peerEphemeralPublicKey": "<base64 SEC1>",   // CONFIRM only
//!   "timestamp": 1700000000000,
//!   "nonce": "<hex>",
//!   "sequence": 1 | 2,
//!   "signature": "<base64 r||s>"
//! }
//! ```
//!
//! The wire form is flat JSON. Decoding goes through [`WireHandshake`] and is
//! rejected unless the field set matches the declared `type` exactly.

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Sequence number carried by every INIT record
pub const INIT_SEQUENCE: u64 = 1;

/// Sequence number carried by every CONFIRM record
pub const CONFIRM_SEQUENCE: u64 = 2;

/// Handshake record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeKind {
    /// Initiator's opening record
    Init,
    /// Responder's answer
    Confirm,
}

impl HandshakeKind {
    /// Wire name of this record type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Confirm => "CONFIRM",
        }
    }

    /// Fixed sequence number for this record type.
    pub fn sequence(self) -> u64 {
        match self {
            Self::Init => INIT_SEQUENCE,
            Self::Confirm => CONFIRM_SEQUENCE,
        }
    }
}

impl std::fmt::Display for HandshakeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields common to both record types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeBody {
    /// Sender's user id
    pub from: String,
    /// Recipient's user id
    pub to: String,
    /// Sender's long-term identity key (uncompressed SEC1)
    pub identity_public_key: Vec<u8>,
    /// Sender's ephemeral key for this attempt (uncompressed SEC1)
    pub ephemeral_public_key: Vec<u8>,
    /// Creation time, milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Random per-record token
    pub nonce: String,
    /// Record sequence ([`INIT_SEQUENCE`] or [`CONFIRM_SEQUENCE`])
    pub sequence: u64,
}

/// Unsigned handshake payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakePayload {
    /// Initiator's opening record
    Init(HandshakeBody),
    /// Responder's answer, bound to the initiator's ephemeral key
    Confirm {
        /// Common fields
        body: HandshakeBody,
        /// Initiator's ephemeral key this CONFIRM answers
        peer_ephemeral_public_key: Vec<u8>,
    },
}

impl HandshakePayload {
    /// Record type of this payload.
    pub fn kind(&self) -> HandshakeKind {
        match self {
            Self::Init(_) => HandshakeKind::Init,
            Self::Confirm { .. } => HandshakeKind::Confirm,
        }
    }

    /// Common fields.
    pub fn body(&self) -> &HandshakeBody {
        match self {
            Self::Init(body) | Self::Confirm { body, .. } => body,
        }
    }

    /// Mutable access to common fields.
    pub fn body_mut(&mut self) -> &mut HandshakeBody {
        match self {
            Self::Init(body) | Self::Confirm { body, .. } => body,
        }
    }

    /// Initiator ephemeral key embedded in a CONFIRM. `None` for INIT.
    pub fn peer_ephemeral_public_key(&self) -> Option<&[u8]> {
        match self {
            Self::Init(_) => None,
            Self::Confirm { peer_ephemeral_public_key, .. } => Some(peer_ephemeral_public_key),
        }
    }
}

/// A handshake payload with its ECDSA signature.
///
/// Immutable once signed. The mailbox stores these keyed by
/// `(from, to, kind)` and returns the most recent on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireHandshake", into = "WireHandshake")]
pub struct SignedHandshake {
    /// Signed content
    pub payload: HandshakePayload,
    /// ECDSA P-256 signature (`r || s`) over the canonical payload bytes
    pub signature: Vec<u8>,
}

impl SignedHandshake {
    /// Record type.
    pub fn kind(&self) -> HandshakeKind {
        self.payload.kind()
    }

    /// Sender's user id.
    pub fn from(&self) -> &str {
        &self.payload.body().from
    }

    /// Recipient's user id.
    pub fn to(&self) -> &str {
        &self.payload.body().to
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Flat JSON form of a [`SignedHandshake`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WireHandshake {
    #[serde(rename = "type")]
    kind: HandshakeKind,
    from: String,
    to: String,
    #[serde(with = "crate::b64")]
    identity_public_key: Vec<u8>,
    #[serde(with = "crate::b64")]
    ephemeral_public_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_b64")]
    peer_ephemeral_public_key: Option<Vec<u8>>,
    timestamp: u64,
    nonce: String,
    sequence: u64,
    #[serde(with = "crate::b64")]
    signature: Vec<u8>,
}

impl From<SignedHandshake> for WireHandshake {
    fn from(record: SignedHandshake) -> Self {
        let kind = record.kind();
        let (body, peer_ephemeral_public_key) = match record.payload {
            HandshakePayload::Init(body) => (body, None),
            HandshakePayload::Confirm { body, peer_ephemeral_public_key } => {
                (body, Some(peer_ephemeral_public_key))
            },
        };

        Self {
            kind,
            from: body.from,
            to: body.to,
            identity_public_key: body.identity_public_key,
            ephemeral_public_key: body.ephemeral_public_key,
            peer_ephemeral_public_key,
            timestamp: body.timestamp,
            nonce: body.nonce,
            sequence: body.sequence,
            signature: record.signature,
        }
    }
}

impl TryFrom<WireHandshake> for SignedHandshake {
    type Error = ProtocolError;

    fn try_from(wire: WireHandshake) -> Result<Self, Self::Error> {
        let body = HandshakeBody {
            from: wire.from,
            to: wire.to,
            identity_public_key: wire.identity_public_key,
            ephemeral_public_key: wire.ephemeral_public_key,
            timestamp: wire.timestamp,
            nonce: wire.nonce,
            sequence: wire.sequence,
        };

        let payload = match (wire.kind, wire.peer_ephemeral_public_key) {
            (HandshakeKind::Init, None) => HandshakePayload::Init(body),
            (HandshakeKind::Init, Some(_)) => {
                return Err(ProtocolError::UnexpectedField {
                    kind: "INIT",
                    field: "peerEphemeralPublicKey",
                });
            },
            (HandshakeKind::Confirm, Some(peer_ephemeral_public_key)) => {
                HandshakePayload::Confirm { body, peer_ephemeral_public_key }
            },
            (HandshakeKind::Confirm, None) => {
                return Err(ProtocolError::MissingField {
                    kind: "CONFIRM",
                    field: "peerEphemeralPublicKey",
                });
            },
        };

        Ok(Self { payload, signature: wire.signature })
    }
}

mod optional_b64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_str(&crate::b64::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|text| crate::b64::decode(&text).map_err(D::Error::custom))
            .transpose()
    }
}
