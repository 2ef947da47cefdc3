use serde::Serialize;

use super::{Conversation, Listing, User};

pub const LOADING_LABEL: &str = "Loading…";
pub const UNKNOWN_LISTING_LABEL: &str = "Unknown listing";

/// A display field that may still be resolving.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "state", content = "text", rename_all = "snake_case")]
pub enum DisplayText {
    Loading,
    Ready(String),
    /// The referenced record does not exist; this value is final.
    Fallback(String),
}

impl DisplayText {
    pub fn as_str(&self) -> &str {
        match self {
            DisplayText::Loading => LOADING_LABEL,
            DisplayText::Ready(text) | DisplayText::Fallback(text) => text,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, DisplayText::Loading)
    }
}

/// Render-ready projection of a conversation joined with its listing and
/// counterpart user. Never persisted.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub other_participant_id: String,
    pub title: DisplayText,
    pub thumbnail: DisplayText,
    pub last_message: String,
    pub last_message_timestamp: i64,
}

impl ConversationSummary {
    /// Pure projection. `listing` and `user` are `None` while loading,
    /// `Some(None)` once the lookup found nothing.
    pub fn project(
        conversation: &Conversation,
        viewer_id: &str,
        listing: Option<Option<&Listing>>,
        user: Option<Option<&User>>,
    ) -> Self {
        let other_participant_id = conversation
            .other_participant(viewer_id)
            .unwrap_or_default()
            .to_string();

        let title = if conversation.is_renter(viewer_id) {
            match listing {
                None => DisplayText::Loading,
                Some(Some(listing)) => DisplayText::Ready(listing.title.clone()),
                Some(None) => DisplayText::Fallback(UNKNOWN_LISTING_LABEL.to_string()),
            }
        } else {
            match user {
                None => DisplayText::Loading,
                Some(Some(user)) => DisplayText::Ready(user.full_name.clone()),
                Some(None) => DisplayText::Fallback(other_participant_id.clone()),
            }
        };

        let thumbnail = match listing {
            None => DisplayText::Loading,
            Some(Some(listing)) => DisplayText::Ready(listing.thumbnail().to_string()),
            Some(None) => DisplayText::Fallback(String::new()),
        };

        Self {
            conversation_id: conversation.conversation_id.clone(),
            other_participant_id,
            title,
            thumbnail,
            last_message: conversation.last_message.clone(),
            last_message_timestamp: conversation.last_message_timestamp,
        }
    }

    pub fn title_text(&self) -> &str {
        self.title.as_str()
    }

    pub fn thumbnail_url(&self) -> &str {
        match &self.thumbnail {
            DisplayText::Ready(url) => url,
            _ => "",
        }
    }
}
