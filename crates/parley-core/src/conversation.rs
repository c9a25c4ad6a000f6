//! Conversation identity and deterministic role assignment.
//!
//! Both peers compute the same conversation id and the same roles from the
//! two user ids alone, so no negotiation message is ever needed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between the two sorted participant ids
pub const CONVERSATION_SEPARATOR: char = '_';

/// Canonical id of a two-party conversation.
///
/// Built from the participant ids sorted lexicographically (byte order) and
/// joined with `_`, so `ConversationId::new(a, b) == ConversationId::new(b,
/// a)`. Used as the HKDF salt and as the scope key for local state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Conversation id for two participants, in either order.
    pub fn new(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{low}{CONVERSATION_SEPARATOR}{high}"))
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Handshake role of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Publishes INIT, waits for CONFIRM
    Initiator,
    /// Waits for INIT, publishes CONFIRM
    Responder,
}

/// Role of `my_id` in a conversation with `peer_id`.
///
/// The lexicographically smaller id is the initiator. For distinct ids the
/// two sides always get opposite roles. Equal ids are rejected before any
/// handshake starts.
pub fn role(my_id: &str, peer_id: &str) -> Role {
    if my_id < peer_id { Role::Initiator } else { Role::Responder }
}
