//! Encrypted message and file envelopes.
//!
//! One envelope per chat message or per file. The relay never sees
//! plaintext; it only inspects the header fields (sender, receiver, nonce,
//! sequence) to route and replay-check.
//!
//! # Associated data
//!
//! Every header field except the ciphertext and IV is bound into the AEAD
//! tag via [`EncryptedEnvelope::associated_data`], so a relay that rewrites
//! the sender, sequence, key version or filename causes decryption to fail.

use serde::{Deserialize, Serialize};

/// AES-GCM IV length carried on the wire
pub const ENVELOPE_IV_SIZE: usize = 12;

/// Domain label prefixed to the associated data
const ENVELOPE_AAD_LABEL: &[u8] = b"parley-envelope-v1";

/// An AEAD-encrypted message or file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// Sender's user id
    pub sender_id: String,
    /// Receiver's user id
    pub receiver_id: String,
    /// Ciphertext with the 16-byte GCM tag appended
    #[serde(with = "crate::b64")]
    pub ciphertext: Vec<u8>,
    /// Random 96-bit IV, unique per encryption
    #[serde(with = "crate::b64::array")]
    pub iv: [u8; ENVELOPE_IV_SIZE],
    /// Replay token, unique per sender
    pub nonce: String,
    /// Per-sender monotonic sequence number (starts at 1)
    pub sequence_number: u64,
    /// Session key version used to encrypt
    pub key_version: u32,
    /// Creation time, milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Original file name, present only for file envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl EncryptedEnvelope {
    /// Whether this envelope carries a file rather than a chat message.
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }

    /// Canonical header bytes authenticated alongside the ciphertext.
    ///
    /// Layout: label, then each field in fixed order. Strings are
    /// length-prefixed (u32 BE), integers are big-endian, and the optional
    /// filename is preceded by a presence byte.
    pub fn associated_data(&self) -> Vec<u8> {
        header_bytes(&EnvelopeHeader {
            sender_id: &self.sender_id,
            receiver_id: &self.receiver_id,
            nonce: &self.nonce,
            sequence_number: self.sequence_number,
            key_version: self.key_version,
            timestamp: self.timestamp,
            filename: self.filename.as_deref(),
        })
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

/// Borrowed header fields, used to compute associated data before the
/// ciphertext exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader<'a> {
    /// Sender's user id
    pub sender_id: &'a str,
    /// Receiver's user id
    pub receiver_id: &'a str,
    /// Replay token
    pub nonce: &'a str,
    /// Per-sender sequence number
    pub sequence_number: u64,
    /// Session key version
    pub key_version: u32,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    /// File name for file envelopes
    pub filename: Option<&'a str>,
}

impl EnvelopeHeader<'_> {
    /// Canonical associated-data bytes for this header.
    pub fn associated_data(&self) -> Vec<u8> {
        header_bytes(self)
    }
}

fn header_bytes(header: &EnvelopeHeader<'_>) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        ENVELOPE_AAD_LABEL.len()
            + 3 * 4
            + header.sender_id.len()
            + header.receiver_id.len()
            + header.nonce.len()
            + 8
            + 4
            + 8
            + 1
            + header.filename.map_or(0, |name| 4 + name.len()),
    );

    out.extend_from_slice(ENVELOPE_AAD_LABEL);
    put_str(&mut out, header.sender_id);
    put_str(&mut out, header.receiver_id);
    put_str(&mut out, header.nonce);
    out.extend_from_slice(&header.sequence_number.to_be_bytes());
    out.extend_from_slice(&header.key_version.to_be_bytes());
    out.extend_from_slice(&header.timestamp.to_be_bytes());
    match header.filename {
        Some(name) => {
            out.push(1);
            put_str(&mut out, name);
        },
        None => out.push(0),
    }

    out
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// An envelope as persisted by the transport, with its assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEnvelope {
    /// Transport-assigned id, increasing in append order
    pub id: u64,
    /// The envelope as received
    pub envelope: EncryptedEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> EncryptedEnvelope {
        EncryptedEnvelope {
            sender_id: "a1".to_string(),
            receiver_id: "b2".to_string(),
            ciphertext: vec![0xAB; 21],
            iv: [3; ENVELOPE_IV_SIZE],
            nonce: "6e6f6e6365".to_string(),
            sequence_number: 1,
            key_version: 1,
            timestamp: 1_700_000_000_000,
            filename: None,
        }
    }

    #[test]
    fn wire_field_names() {
        let value: serde_json::Value = serde_json::from_slice(&envelope().to_json().unwrap()).unwrap();
        for field in [
            "senderId",
            "receiverId",
            "ciphertext",
            "iv",
            "nonce",
            "sequenceNumber",
            "keyVersion",
            "timestamp",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert!(value.get("filename").is_none());
        assert_eq!(value["iv"], "AwMDAwMDAwMDAwMD");
    }

    #[test]
    fn file_envelope_roundtrip() {
        let mut file = envelope();
        file.filename = Some("report.pdf".to_string());

        let decoded = EncryptedEnvelope::from_json(&file.to_json().unwrap()).unwrap();
        assert_eq!(decoded, file);
        assert!(decoded.is_file());
    }

    #[test]
    fn short_iv_rejected() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&envelope().to_json().unwrap()).unwrap();
        value["iv"] = serde_json::Value::String("AAAA".to_string());
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(EncryptedEnvelope::from_json(&bytes).is_err());
    }

    #[test]
    fn associated_data_covers_header_fields() {
        let base = envelope();
        let aad = base.associated_data();

        let mut changed = base.clone();
        changed.sequence_number = 2;
        assert_ne!(changed.associated_data(), aad);

        let mut changed = base.clone();
        changed.sender_id = "c3".to_string();
        assert_ne!(changed.associated_data(), aad);

        let mut changed = base.clone();
        changed.filename = Some(String::new());
        assert_ne!(changed.associated_data(), aad);

        let mut changed = base.clone();
        changed.ciphertext = vec![0; 16];
        assert_eq!(changed.associated_data(), aad, "ciphertext is not part of the header");
    }

    #[test]
    fn length_prefix_prevents_field_shifting() {
        let mut left = envelope();
        left.sender_id = "a1b".to_string();
        left.receiver_id = "2".to_string();
        let mut right = envelope();
        right.sender_id = "a1".to_string();
        right.receiver_id = "b2".to_string();
        assert_ne!(left.associated_data(), right.associated_data());
    }

    #[test]
    fn header_matches_envelope() {
        let env = envelope();
        let header = EnvelopeHeader {
            sender_id: &env.sender_id,
            receiver_id: &env.receiver_id,
            nonce: &env.nonce,
            sequence_number: env.sequence_number,
            key_version: env.key_version,
            timestamp: env.timestamp,
            filename: None,
        };
        assert_eq!(header.associated_data(), env.associated_data());
    }
}
