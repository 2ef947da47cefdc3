use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::index::IndexStatus;
use crate::models::{ConversationSummary, Message};
use crate::stream::MAX_MESSAGE_CHARS;

/// Validation constants
const MAX_ID_LENGTH: usize = 256;
/// Byte cap; the character limit is enforced by the append path.
const MAX_TEXT_BYTES: usize = MAX_MESSAGE_CHARS * 4;

/// Frames a client may send
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        user_id: String,
        #[serde(default)]
        token: Option<String>,
    },
    ListConversations,
    OpenConversation(ConversationInput),
    CloseConversation(ConversationInput),
    SendMessage(SendMessageInput),
    StartConversation(StartConversationInput),
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
pub struct ConversationInput {
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub conversation_id: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
pub struct SendMessageInput {
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub conversation_id: String,
    /// Always replaced by the connection's identity
    #[serde(default)]
    #[garde(skip)]
    pub sender_id: String,
    #[garde(length(min = 1, max = MAX_TEXT_BYTES))]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(()))]
pub struct StartConversationInput {
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub product_id: String,
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub seller_id: String,
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub renter_id: String,
    /// Always replaced by the connection's identity
    #[serde(default)]
    #[garde(skip)]
    pub sender_id: String,
    #[garde(length(min = 1, max = MAX_TEXT_BYTES))]
    pub text: String,
}

/// Frames the server sends
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthResponse {
        success: bool,
        message: String,
    },
    Conversations {
        status: IndexStatus,
        items: Vec<ConversationSummary>,
    },
    Opened {
        conversation_id: String,
    },
    Closed {
        conversation_id: String,
    },
    Message {
        message: Message,
    },
    SendResult {
        conversation_id: String,
        message: Message,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(err: &ChatError) -> Self {
        ServerFrame::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Run garde validation, mapping failures to a validation error.
pub fn validated<T: Validate<Context = ()>>(input: T) -> Result<T> {
    input
        .validate()
        .map_err(|e| ChatError::validation(e.to_string()))?;
    Ok(input)
}
