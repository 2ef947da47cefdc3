//! Rental Chat
//!
//! Conversation and messaging core for the rental marketplace: the live
//! conversation list, per-conversation message streams, the send path and
//! new-message notifications, over a pluggable entity store.

pub mod config;
pub mod dispatch;
pub mod enricher;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod index;
pub mod live;
pub mod models;
pub mod service;
pub mod store;
pub mod stream;

pub use config::ChatConfig;
pub use dispatch::{
    ChannelDispatcher, DispatchLedger, DispatchRequest, LogDispatcher, NotificationDispatcher,
};
pub use error::{ChatError, Result, StoreError};
pub use feed::{ConversationFeed, FeedState};
pub use gateway::{handle_connection, serve, GatewayState};
pub use index::{ConversationIndex, IndexHandle, IndexState, IndexStatus};
pub use live::{Backoff, Health};
pub use service::{ChatService, ConversationView};
pub use store::{EntityStore, MemoryStore, SeedData};
