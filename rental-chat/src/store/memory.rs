use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Change, EntityStore, SeedData, Subscription};
use crate::error::{StoreError, StoreResult};
use crate::models::{Conversation, Listing, Message, MessageDraft, User};

type Watcher<T> = mpsc::UnboundedSender<StoreResult<T>>;

/// A conversation plus everything that must change together with it.
struct ConversationRecord {
    conversation: Conversation,
    messages: Vec<Message>,
    /// idempotency key -> index into `messages`
    accepted: HashMap<String, usize>,
    /// Message subscribers, notified while the record is locked so that
    /// delivery order equals acceptance order
    watchers: Vec<Watcher<Change<Message>>>,
}

impl ConversationRecord {
    fn next_timestamp(&self) -> i64 {
        let last = self
            .messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or(0)
            .max(self.conversation.last_message_timestamp);
        chrono::Utc::now().timestamp_millis().max(last + 1)
    }
}

/// In-process entity store with live subscriptions.
///
/// Lock order is fixed: a `conversations` entry may be held while touching
/// `viewer_watchers`, and a `*_watchers` entry may be held while touching
/// `listings`/`users`, never the other way around.
pub struct MemoryStore {
    listings: DashMap<String, Listing>,
    users: DashMap<String, User>,
    listing_watchers: DashMap<String, Vec<Watcher<Option<Listing>>>>,
    user_watchers: DashMap<String, Vec<Watcher<Option<User>>>>,
    conversations: DashMap<String, ConversationRecord>,
    /// viewer_id -> conversation list subscribers
    viewer_watchers: DashMap<String, Vec<Watcher<Change<Conversation>>>>,
    transactional: bool,
    failing_subscribes: AtomicUsize,
    failing_summary_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            listings: DashMap::new(),
            users: DashMap::new(),
            listing_watchers: DashMap::new(),
            user_watchers: DashMap::new(),
            conversations: DashMap::new(),
            viewer_watchers: DashMap::new(),
            transactional: true,
            failing_subscribes: AtomicUsize::new(0),
            failing_summary_writes: AtomicUsize::new(0),
        }
    }

    /// A store without multi-key writes: `append_message` only writes the
    /// message and callers must follow up with `record_last_message`.
    pub fn non_transactional() -> Self {
        Self {
            transactional: false,
            ..Self::new()
        }
    }

    pub fn from_seed(seed: SeedData) -> Self {
        let store = Self::new();
        store.load_seed(seed);
        store
    }

    pub fn load_seed(&self, seed: SeedData) {
        let (listings, users) = (seed.listings.len(), seed.users.len());
        for listing in seed.listings {
            self.put_listing(listing);
        }
        for user in seed.users {
            self.put_user(user);
        }
        info!("Seeded store with {} listings and {} users", listings, users);
    }

    pub fn put_listing(&self, listing: Listing) {
        let mut watchers = self
            .listing_watchers
            .entry(listing.product_id.clone())
            .or_default();
        self.listings
            .insert(listing.product_id.clone(), listing.clone());
        notify(&mut watchers, Some(listing));
    }

    pub fn remove_listing(&self, product_id: &str) {
        let mut watchers = self
            .listing_watchers
            .entry(product_id.to_string())
            .or_default();
        self.listings.remove(product_id);
        notify(&mut watchers, None);
    }

    pub fn put_user(&self, user: User) {
        let mut watchers = self.user_watchers.entry(user.uid.clone()).or_default();
        self.users.insert(user.uid.clone(), user.clone());
        notify(&mut watchers, Some(user));
    }

    pub fn remove_user(&self, uid: &str) {
        let mut watchers = self.user_watchers.entry(uid.to_string()).or_default();
        self.users.remove(uid);
        notify(&mut watchers, None);
    }

    /// Messages of a conversation in store order.
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .get(conversation_id)
            .map(|record| record.messages.clone())
            .unwrap_or_default()
    }

    /// Break every live conversation-list and message subscription with a
    /// transient error, as a dropped backend connection would.
    pub fn interrupt_subscriptions(&self) {
        let reason = || StoreError::Unavailable("connection interrupted".to_string());
        for mut entry in self.viewer_watchers.iter_mut() {
            for tx in entry.value_mut().drain(..) {
                let _ = tx.send(Err(reason()));
            }
        }
        for mut record in self.conversations.iter_mut() {
            for tx in record.watchers.drain(..) {
                let _ = tx.send(Err(reason()));
            }
        }
        warn!("All live subscriptions interrupted");
    }

    /// Make the next `count` subscribe calls fail with a transient error.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` `record_last_message` calls fail.
    pub fn fail_next_summary_writes(&self, count: usize) {
        self.failing_summary_writes.store(count, Ordering::SeqCst);
    }

    /// Number of live conversation-list subscribers for a viewer
    pub fn viewer_subscriber_count(&self, viewer_id: &str) -> usize {
        self.viewer_watchers
            .get(viewer_id)
            .map(|w| w.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn check_subscribe(&self, what: &str) -> StoreResult<()> {
        if take_failure(&self.failing_subscribes) {
            debug!("Injected subscribe failure for {}", what);
            return Err(StoreError::Unavailable(format!(
                "subscribe to {} failed",
                what
            )));
        }
        Ok(())
    }

    fn notify_viewers(&self, conversation: &Conversation) {
        for viewer in [&conversation.seller_id, &conversation.renter_id] {
            if let Some(mut watchers) = self.viewer_watchers.get_mut(viewer.as_str()) {
                notify(&mut watchers, Change::Upsert(conversation.clone()));
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Push `value` to every open watcher and drop the closed ones.
fn notify<T: Clone>(watchers: &mut Vec<Watcher<T>>, value: T) {
    watchers.retain(|tx| tx.send(Ok(value.clone())).is_ok());
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl EntityStore for MemoryStore {
    async fn get_listing(&self, product_id: &str) -> StoreResult<Option<Listing>> {
        Ok(self.listings.get(product_id).map(|l| l.clone()))
    }

    async fn get_user(&self, uid: &str) -> StoreResult<Option<User>> {
        Ok(self.users.get(uid).map(|u| u.clone()))
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|record| record.conversation.clone()))
    }

    async fn create_conversation(&self, conversation: Conversation) -> StoreResult<Conversation> {
        let record = self
            .conversations
            .entry(conversation.conversation_id.clone())
            .or_insert_with(|| {
                info!(
                    conversation_id = %conversation.conversation_id,
                    product_id = %conversation.product_id,
                    "Conversation created"
                );
                ConversationRecord {
                    conversation: conversation.clone(),
                    messages: Vec::new(),
                    accepted: HashMap::new(),
                    watchers: Vec::new(),
                }
            });
        let stored = record.conversation.clone();
        if stored == conversation {
            self.notify_viewers(&stored);
        }
        Ok(stored)
    }

    async fn append_message(&self, draft: MessageDraft) -> StoreResult<Message> {
        let mut record = self
            .conversations
            .get_mut(&draft.conversation_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "conversation",
                id: draft.conversation_id.clone(),
            })?;

        if let Some(&index) = record.accepted.get(&draft.idempotency_key) {
            debug!(
                conversation_id = %draft.conversation_id,
                key = %draft.idempotency_key,
                "Duplicate append ignored"
            );
            return Ok(record.messages[index].clone());
        }

        let seq = record.messages.len() as u64 + 1;
        let message = Message {
            message_id: Message::id_for(&draft.conversation_id, seq),
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            text: draft.text,
            timestamp: record.next_timestamp(),
            seq,
        };
        let index = record.messages.len();
        record.messages.push(message.clone());
        record.accepted.insert(draft.idempotency_key, index);
        notify(&mut record.watchers, Change::Upsert(message.clone()));

        if self.transactional {
            record.conversation.last_message = message.text.clone();
            record.conversation.last_message_timestamp = message.timestamp;
            self.notify_viewers(&record.conversation);
        }

        Ok(message)
    }

    async fn record_last_message(&self, message: &Message) -> StoreResult<Conversation> {
        if take_failure(&self.failing_summary_writes) {
            return Err(StoreError::Unavailable(
                "conversation summary write failed".to_string(),
            ));
        }

        let mut record = self
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "conversation",
                id: message.conversation_id.clone(),
            })?;

        if message.timestamp >= record.conversation.last_message_timestamp {
            record.conversation.last_message = message.text.clone();
            record.conversation.last_message_timestamp = message.timestamp;
            self.notify_viewers(&record.conversation);
        }
        Ok(record.conversation.clone())
    }

    fn is_transactional(&self) -> bool {
        self.transactional
    }

    async fn subscribe_listing(
        &self,
        product_id: &str,
    ) -> StoreResult<Subscription<Option<Listing>>> {
        self.check_subscribe("listing")?;
        let (tx, sub) = Subscription::channel();
        let mut watchers = self
            .listing_watchers
            .entry(product_id.to_string())
            .or_default();
        let current = self.listings.get(product_id).map(|l| l.clone());
        if tx.send(Ok(current)).is_ok() {
            watchers.push(tx);
        }
        Ok(sub)
    }

    async fn subscribe_user(&self, uid: &str) -> StoreResult<Subscription<Option<User>>> {
        self.check_subscribe("user")?;
        let (tx, sub) = Subscription::channel();
        let mut watchers = self.user_watchers.entry(uid.to_string()).or_default();
        let current = self.users.get(uid).map(|u| u.clone());
        if tx.send(Ok(current)).is_ok() {
            watchers.push(tx);
        }
        Ok(sub)
    }

    async fn subscribe_conversations(
        &self,
        viewer_id: &str,
    ) -> StoreResult<Subscription<Change<Conversation>>> {
        self.check_subscribe("conversations")?;
        let (tx, sub) = Subscription::channel();

        // Register before reading so no change is missed. An upsert may then
        // arrive ahead of a snapshot holding an older copy of the same
        // record; consumers keep the newer of the two.
        self.viewer_watchers
            .entry(viewer_id.to_string())
            .or_default()
            .push(tx.clone());

        let snapshot: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|record| record.conversation.is_participant(viewer_id))
            .map(|record| record.conversation.clone())
            .collect();
        let _ = tx.send(Ok(Change::Snapshot(snapshot)));
        Ok(sub)
    }

    async fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Subscription<Change<Message>>> {
        self.check_subscribe("messages")?;
        let mut record =
            self.conversations
                .get_mut(conversation_id)
                .ok_or_else(|| StoreError::NotFound {
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })?;

        let (tx, sub) = Subscription::channel();
        if tx.send(Ok(Change::Snapshot(record.messages.clone()))).is_ok() {
            record.watchers.push(tx);
        }
        Ok(sub)
    }
}
