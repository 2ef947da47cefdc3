use serde::{Deserialize, Serialize};

/// A chat message. Immutable once the store has accepted it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    /// Store-assigned, strictly increasing within a conversation
    pub timestamp: i64,
    /// Position in the conversation, starting at 1
    pub seq: u64,
}

impl Message {
    /// Order-preserving id: lexicographic order matches `seq` order.
    pub fn id_for(conversation_id: &str, seq: u64) -> String {
        format!("{}-{:012}", conversation_id, seq)
    }
}

/// A message the caller wants appended; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    /// Chosen by the sender. Appending a draft whose key the conversation
    /// has already accepted returns the stored message instead of a new one.
    pub idempotency_key: String,
}

impl MessageDraft {
    pub fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
        }
    }
}
