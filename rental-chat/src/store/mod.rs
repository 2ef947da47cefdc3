//! Entity Store seam.
//!
//! The backing store is a remote keyed service with point reads, appends and
//! push subscriptions. Everything above this module talks to it only through
//! [`EntityStore`]; [`MemoryStore`] is the in-process implementation used by
//! the server binary and the tests.

mod memory;
mod seed;

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::StoreResult;
use crate::models::{Conversation, Listing, Message, MessageDraft, User};

pub use memory::MemoryStore;
pub use seed::SeedData;

/// One push from a collection subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    /// Full replacement of everything the subscription covers
    Snapshot(Vec<T>),
    /// One record was created or its mutable fields changed
    Upsert(T),
}

/// Live push channel from the store.
///
/// An `Err` item means the subscription broke; the channel closes right
/// after it. A closed channel without an error is treated the same way.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<StoreResult<T>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<StoreResult<T>>) -> Self {
        Self { rx }
    }

    /// Create a connected sender/subscription pair.
    pub fn channel() -> (mpsc::UnboundedSender<StoreResult<T>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    pub async fn next(&mut self) -> Option<StoreResult<T>> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<StoreResult<T>> {
        self.rx.try_recv().ok()
    }
}

/// Operations the conversation core needs from the backing store.
///
/// Implementations must assign message timestamps themselves so that every
/// accepted message sorts after all earlier ones in its conversation.
pub trait EntityStore: Send + Sync + 'static {
    fn get_listing(&self, product_id: &str)
        -> impl Future<Output = StoreResult<Option<Listing>>> + Send;

    fn get_user(&self, uid: &str) -> impl Future<Output = StoreResult<Option<User>>> + Send;

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = StoreResult<Option<Conversation>>> + Send;

    /// Insert the conversation unless one with the same id exists.
    /// Returns the stored record either way.
    fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> impl Future<Output = StoreResult<Conversation>> + Send;

    /// Write a message with a store-assigned timestamp. When
    /// [`is_transactional`](Self::is_transactional) is true the owning
    /// conversation's last-message fields are updated in the same write.
    /// A draft whose idempotency key was already accepted returns the
    /// stored message and writes nothing.
    fn append_message(&self, draft: MessageDraft)
        -> impl Future<Output = StoreResult<Message>> + Send;

    /// Move the conversation's last-message fields forward to `message`.
    /// A message older than the recorded one leaves the record unchanged.
    fn record_last_message(
        &self,
        message: &Message,
    ) -> impl Future<Output = StoreResult<Conversation>> + Send;

    fn is_transactional(&self) -> bool;

    /// Current value (or `None`) first, then every change, `None` on delete.
    fn subscribe_listing(
        &self,
        product_id: &str,
    ) -> impl Future<Output = StoreResult<Subscription<Option<Listing>>>> + Send;

    fn subscribe_user(
        &self,
        uid: &str,
    ) -> impl Future<Output = StoreResult<Subscription<Option<User>>>> + Send;

    /// Conversations where `viewer_id` is seller or renter: a snapshot first,
    /// then upserts.
    fn subscribe_conversations(
        &self,
        viewer_id: &str,
    ) -> impl Future<Output = StoreResult<Subscription<Change<Conversation>>>> + Send;

    /// Messages of one conversation in store order: a snapshot first, then
    /// one upsert per accepted message.
    fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = StoreResult<Subscription<Change<Message>>>> + Send;
}
