//! Decrypted conversation items

use parley_proto::EncryptedEnvelope;

/// Decrypted content of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Chat message. Invalid UTF-8 is replaced, never rejected.
    Text(String),
    /// Shared file
    File {
        /// Name given by the sender
        filename: String,
        /// File contents
        data: Vec<u8>,
    },
}

/// One decrypted item of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationItem {
    /// Relay envelope id
    pub id: u64,
    /// Sender's user id
    pub sender_id: String,
    /// Receiver's user id
    pub receiver_id: String,
    /// Sender's wall clock at encryption (ms since epoch)
    pub timestamp: u64,
    /// Sender's sequence number
    pub sequence_number: u64,
    /// Session key version used
    pub key_version: u32,
    /// Decrypted content
    pub body: MessageBody,
}

impl ConversationItem {
    pub(crate) fn new(id: u64, envelope: EncryptedEnvelope, plaintext: Vec<u8>) -> Self {
        let body = match envelope.filename {
            Some(filename) => MessageBody::File { filename, data: plaintext },
            None => MessageBody::Text(String::from_utf8_lossy(&plaintext).into_owned()),
        };

        Self {
            id,
            sender_id: envelope.sender_id,
            receiver_id: envelope.receiver_id,
            timestamp: envelope.timestamp,
            sequence_number: envelope.sequence_number,
            key_version: envelope.key_version,
            body,
        }
    }

    /// Message text, if this item is a chat message.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(text) => Some(text),
            MessageBody::File { .. } => None,
        }
    }
}

/// A decrypted conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    /// Decrypted items, oldest first
    pub items: Vec<ConversationItem>,
    /// Envelopes that could not be decrypted
    pub skipped: usize,
}

impl Conversation {
    /// Texts of all chat messages, oldest first.
    pub fn texts(&self) -> Vec<&str> {
        self.items.iter().filter_map(ConversationItem::text).collect()
    }
}

/// A downloaded and decrypted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    /// Relay envelope id
    pub id: u64,
    /// Name given by the sender
    pub filename: String,
    /// File contents
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(filename: Option<&str>) -> EncryptedEnvelope {
        EncryptedEnvelope {
            sender_id: "a1".into(),
            receiver_id: "b2".into(),
            ciphertext: vec![0; 16],
            iv: [0; 12],
            nonce: "n".into(),
            sequence_number: 3,
            key_version: 2,
            timestamp: 10,
            filename: filename.map(str::to_owned),
        }
    }

    #[test]
    fn text_item() {
        let item = ConversationItem::new(7, envelope(None), b"hello".to_vec());
        assert_eq!(item.text(), Some("hello"));
        assert_eq!(item.key_version, 2);
    }

    #[test]
    fn file_item_keeps_bytes() {
        let item = ConversationItem::new(8, envelope(Some("notes.txt")), vec![0xFF, 0x00]);
        assert_eq!(item.text(), None);
        assert_eq!(
            item.body,
            MessageBody::File { filename: "notes.txt".into(), data: vec![0xFF, 0x00] }
        );
    }

    #[test]
    fn invalid_utf8_text_is_replaced() {
        let item = ConversationItem::new(9, envelope(None), vec![b'h', 0xFF]);
        assert_eq!(item.text(), Some("h\u{FFFD}"));
    }
}
