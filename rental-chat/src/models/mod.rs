mod conversation;
mod listing;
mod message;
mod summary;
mod user;

pub use conversation::Conversation;
pub use listing::Listing;
pub use message::{Message, MessageDraft};
pub use summary::{ConversationSummary, DisplayText, LOADING_LABEL, UNKNOWN_LISTING_LABEL};
pub use user::User;
