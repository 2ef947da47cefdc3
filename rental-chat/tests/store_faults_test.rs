//! Service behaviour over a store that drops writes or never answers
//!
//! `FaultyStore` wraps the in-memory store and fails or stalls selected
//! calls, the way a remote backend does on a bad connection.

use rental_chat::error::StoreResult;
use rental_chat::models::{Conversation, DisplayText, Listing, Message, MessageDraft, User};
use rental_chat::store::{Change, Subscription};
use rental_chat::{
    Backoff, ChatConfig, ChatError, ChatService, EntityStore, FeedState, LogDispatcher,
    MemoryStore, StoreError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct FaultyStore {
    inner: MemoryStore,
    /// Appends that fail before reaching the store
    failing_appends: AtomicUsize,
    /// Appends that are written but whose reply is lost
    lost_replies: AtomicUsize,
    /// Listing whose subscription never yields
    stalled_listing: Option<String>,
}

impl FaultyStore {
    fn new(stalled_listing: Option<&str>) -> Self {
        let inner = MemoryStore::new();
        inner.put_listing(listing("drill", "Cordless drill"));
        inner.put_listing(listing("tent", "Four person tent"));
        inner.put_user(User::new("seller", "Sam Seller"));
        inner.put_user(User::new("renter", "Rae Renter"));
        Self {
            inner,
            failing_appends: AtomicUsize::new(0),
            lost_replies: AtomicUsize::new(0),
            stalled_listing: stalled_listing.map(String::from),
        }
    }
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn listing(product_id: &str, title: &str) -> Listing {
    Listing {
        product_id: product_id.to_string(),
        title: title.to_string(),
        image_url: vec![format!("https://img.example/{}.jpg", product_id)],
        flagged: false,
        verified: true,
        availability: true,
    }
}

impl EntityStore for FaultyStore {
    async fn get_listing(&self, product_id: &str) -> StoreResult<Option<Listing>> {
        self.inner.get_listing(product_id).await
    }

    async fn get_user(&self, uid: &str) -> StoreResult<Option<User>> {
        self.inner.get_user(uid).await
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        self.inner.get_conversation(conversation_id).await
    }

    async fn create_conversation(&self, conversation: Conversation) -> StoreResult<Conversation> {
        self.inner.create_conversation(conversation).await
    }

    async fn append_message(&self, draft: MessageDraft) -> StoreResult<Message> {
        if take(&self.failing_appends) {
            return Err(StoreError::Unavailable("blip".to_string()));
        }
        let message = self.inner.append_message(draft).await?;
        if take(&self.lost_replies) {
            return Err(StoreError::Unavailable("reply lost".to_string()));
        }
        Ok(message)
    }

    async fn record_last_message(&self, message: &Message) -> StoreResult<Conversation> {
        self.inner.record_last_message(message).await
    }

    fn is_transactional(&self) -> bool {
        self.inner.is_transactional()
    }

    async fn subscribe_listing(
        &self,
        product_id: &str,
    ) -> StoreResult<Subscription<Option<Listing>>> {
        if self.stalled_listing.as_deref() == Some(product_id) {
            return std::future::pending().await;
        }
        self.inner.subscribe_listing(product_id).await
    }

    async fn subscribe_user(&self, uid: &str) -> StoreResult<Subscription<Option<User>>> {
        self.inner.subscribe_user(uid).await
    }

    async fn subscribe_conversations(
        &self,
        viewer_id: &str,
    ) -> StoreResult<Subscription<Change<Conversation>>> {
        self.inner.subscribe_conversations(viewer_id).await
    }

    async fn subscribe_messages(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Subscription<Change<Message>>> {
        self.inner.subscribe_messages(conversation_id).await
    }
}

fn setup(store: FaultyStore) -> (Arc<ChatService<FaultyStore, LogDispatcher>>, Arc<FaultyStore>) {
    let store = Arc::new(store);
    let config = ChatConfig {
        backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        ..ChatConfig::default()
    };
    let service = Arc::new(ChatService::new(store.clone(), Arc::new(LogDispatcher), &config));
    (service, store)
}

fn texts(store: &FaultyStore, conversation_id: &str) -> Vec<String> {
    store
        .inner
        .messages(conversation_id)
        .into_iter()
        .map(|m| m.text)
        .collect()
}

#[tokio::test]
async fn test_failed_write_is_retried() {
    let (service, store) = setup(FaultyStore::new(None));
    let (conversation, _) = service
        .start_conversation("drill", "seller", "renter", "renter", "first")
        .await
        .unwrap();
    let id = conversation.conversation_id;

    store.failing_appends.store(1, Ordering::SeqCst);
    let sent = service.send_message(&id, "renter", "second").await.unwrap();

    assert_eq!(sent.text, "second");
    assert_eq!(sent.seq, 2);
    assert_eq!(texts(&store, &id), vec!["first", "second"]);
}

#[tokio::test]
async fn test_lost_reply_does_not_duplicate_message() {
    let (service, store) = setup(FaultyStore::new(None));
    let (conversation, _) = service
        .start_conversation("drill", "seller", "renter", "renter", "first")
        .await
        .unwrap();
    let id = conversation.conversation_id;

    store.lost_replies.store(2, Ordering::SeqCst);
    let sent = service.send_message(&id, "renter", "second").await.unwrap();

    assert_eq!(sent.seq, 2);
    assert_eq!(texts(&store, &id), vec!["first", "second"]);
    let latest = store.get_conversation(&id).await.unwrap().unwrap();
    assert_eq!(latest.last_message, "second");
}

#[tokio::test]
async fn test_write_gives_up_after_retry_budget() {
    let (service, store) = setup(FaultyStore::new(None));
    let (conversation, _) = service
        .start_conversation("drill", "seller", "renter", "renter", "first")
        .await
        .unwrap();
    let id = conversation.conversation_id;

    store.failing_appends.store(100, Ordering::SeqCst);
    let err = service.send_message(&id, "renter", "second").await.unwrap_err();

    assert!(matches!(err, ChatError::TransientStore(_)));
    assert!(err.is_transient());
    assert_eq!(texts(&store, &id), vec!["first"]);
}

#[tokio::test]
async fn test_stalled_listing_does_not_hold_up_titles() {
    let (service, _store) = setup(FaultyStore::new(Some("drill")));
    for product_id in ["drill", "tent"] {
        service
            .start_conversation(product_id, "seller", "renter", "renter", "hi")
            .await
            .unwrap();
    }
    let drill = Conversation::derive_id("drill", "seller", "renter");
    let tent = Conversation::derive_id("tent", "seller", "renter");

    let mut feed = service.list_conversations("seller").unwrap();
    let find = |state: &FeedState, id: &str| {
        state
            .items
            .iter()
            .find(|item| item.conversation_id == id)
            .cloned()
    };
    let state = timeout(
        Duration::from_secs(2),
        feed.wait_for(|state| {
            let drill_ready = find(state, &drill).is_some_and(|item| !item.title.is_loading());
            let tent_ready = find(state, &tent)
                .is_some_and(|item| !item.title.is_loading() && !item.thumbnail.is_loading());
            drill_ready && tent_ready
        }),
    )
    .await
    .expect("Timeout waiting for feed")
    .expect("Feed stopped");

    let stuck = find(&state, &drill).unwrap();
    assert_eq!(stuck.title, DisplayText::Ready("Rae Renter".to_string()));
    assert!(stuck.thumbnail.is_loading());

    let resolved = find(&state, &tent).unwrap();
    assert_eq!(resolved.title, DisplayText::Ready("Rae Renter".to_string()));
    assert_eq!(
        resolved.thumbnail,
        DisplayText::Ready("https://img.example/tent.jpg".to_string())
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let later = find(&feed.current(), &drill).unwrap();
    assert!(later.thumbnail.is_loading());
}
