//! Scenario tests for the chat service over the in-memory store
//!
//! These cover ordering under concurrent senders, conversation identity,
//! enrichment fallbacks, notification decisions and view lifetimes.

use rental_chat::models::{Conversation, DisplayText, Listing, User};
use rental_chat::{
    Backoff, ChannelDispatcher, ChatConfig, ChatError, ChatService, DispatchRequest, EntityStore,
    FeedState, IndexStatus, MemoryStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

type Service = ChatService<MemoryStore, ChannelDispatcher>;

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

fn setup(
    store: MemoryStore,
) -> (Arc<Service>, Arc<MemoryStore>, mpsc::UnboundedReceiver<DispatchRequest>) {
    let store = Arc::new(store);
    store.put_listing(listing("drill", "Cordless drill"));
    store.put_listing(listing("tent", "Four person tent"));
    store.put_user(User::new("seller", "Sam Seller").with_device_token("seller-device"));
    store.put_user(User::new("renter", "Rae Renter").with_device_token("renter-device"));

    let config = ChatConfig {
        backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        ..ChatConfig::default()
    };
    let (dispatcher, requests) = ChannelDispatcher::new();
    let service = Arc::new(ChatService::new(store.clone(), Arc::new(dispatcher), &config));
    (service, store, requests)
}

async fn wait_feed(
    feed: &mut rental_chat::ConversationFeed,
    predicate: impl FnMut(&FeedState) -> bool,
) -> FeedState {
    timeout(Duration::from_secs(2), feed.wait_for(predicate))
        .await
        .expect("Timeout waiting for feed")
        .expect("Feed stopped")
}

async fn next_request(rx: &mut mpsc::UnboundedReceiver<DispatchRequest>) -> DispatchRequest {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Timeout waiting for notification")
        .expect("Dispatcher closed")
}

async fn assert_no_request(rx: &mut mpsc::UnboundedReceiver<DispatchRequest>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "Unexpected notification");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_share_one_order() {
    let (service, store, _requests) = setup(MemoryStore::new());
    let (conversation, _) = service
        .start_conversation("drill", "seller", "renter", "renter", "hi")
        .await
        .unwrap();
    let id = conversation.conversation_id.clone();

    let mut view = service.open_conversation(&id, "seller").await.unwrap();

    let mut senders = Vec::new();
    for sender in ["seller", "renter"] {
        let service = service.clone();
        let id = id.clone();
        senders.push(tokio::spawn(async move {
            for i in 0..50 {
                service
                    .send_message(&id, sender, &format!("{} {}", sender, i))
                    .await
                    .unwrap();
            }
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    let stored = store.messages(&id);
    assert_eq!(stored.len(), 101);
    for pair in stored.windows(2) {
        assert_eq!(pair[1].seq, pair[0].seq + 1);
        assert!(pair[1].timestamp > pair[0].timestamp);
        assert!(pair[1].message_id > pair[0].message_id);
    }

    let mut observed = Vec::new();
    while observed.len() < stored.len() {
        let message = timeout(Duration::from_secs(2), view.recv())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended");
        observed.push(message);
    }
    assert_eq!(observed, stored);

    let latest = store.get_conversation(&id).await.unwrap().unwrap();
    assert_eq!(latest.last_message_timestamp, stored[100].timestamp);
}

#[tokio::test]
async fn test_same_pair_on_two_listings_are_distinct() {
    let (service, store, _requests) = setup(MemoryStore::new());
    let (drill, _) = service
        .start_conversation("drill", "seller", "renter", "renter", "drill?")
        .await
        .unwrap();
    let (tent, _) = service
        .start_conversation("tent", "seller", "renter", "renter", "tent?")
        .await
        .unwrap();
    assert_ne!(drill.conversation_id, tent.conversation_id);

    // Starting again reuses the existing conversation
    let (again, message) = service
        .start_conversation("drill", "seller", "renter", "seller", "yes")
        .await
        .unwrap();
    assert_eq!(again.conversation_id, drill.conversation_id);
    assert_eq!(message.seq, 2);

    let tent = store.get_conversation(&tent.conversation_id).await.unwrap().unwrap();
    assert_eq!(tent.last_message, "tent?");
    assert_eq!(store.messages(&tent.conversation_id).len(), 1);
}

#[tokio::test]
async fn test_start_conversation_validation() {
    let (service, store, _requests) = setup(MemoryStore::new());

    let err = service
        .start_conversation("drill", "seller", "seller", "seller", "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    let err = service
        .start_conversation("drill", "seller", "renter", "renter", "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
    let id = Conversation::derive_id("drill", "seller", "renter");
    assert!(store.get_conversation(&id).await.unwrap().is_none());

    let err = service
        .start_conversation("drill", "seller", "renter", "stranger", "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
}

#[tokio::test]
async fn test_feed_orders_by_recency_and_enriches() {
    let (service, _, _requests) = setup(MemoryStore::new());
    let (drill, _) = service
        .start_conversation("drill", "seller", "renter", "renter", "drill?")
        .await
        .unwrap();
    // Distinct milliseconds keep the order independent of id tie-breaks
    tokio::time::sleep(Duration::from_millis(5)).await;
    let (tent, _) = service
        .start_conversation("tent", "seller", "renter", "renter", "tent?")
        .await
        .unwrap();

    let mut feed = service.list_conversations("renter").unwrap();
    let state = wait_feed(&mut feed, |s| {
        s.items.len() == 2 && s.items.iter().all(|i| !i.title.is_loading())
    })
    .await;
    assert_eq!(state.status, IndexStatus::Live);
    assert_eq!(state.items[0].conversation_id, tent.conversation_id);
    assert_eq!(state.items[0].title_text(), "Four person tent");
    assert_eq!(state.items[1].title_text(), "Cordless drill");

    tokio::time::sleep(Duration::from_millis(5)).await;
    service
        .send_message(&drill.conversation_id, "seller", "still free")
        .await
        .unwrap();
    let state = wait_feed(&mut feed, |s| {
        s.items.first().map(|i| i.last_message.as_str()) == Some("still free")
    })
    .await;
    assert_eq!(state.items[0].conversation_id, drill.conversation_id);
    assert_eq!(state.items[1].conversation_id, tent.conversation_id);

    // The seller sees the renter's name instead
    let mut seller_feed = service.list_conversations("seller").unwrap();
    let state = wait_feed(&mut seller_feed, |s| {
        s.items.len() == 2 && s.items.iter().all(|i| !i.title.is_loading())
    })
    .await;
    assert!(state.items.iter().all(|i| i.title_text() == "Rae Renter"));
}

#[tokio::test]
async fn test_deleted_listing_falls_back() {
    let (service, store, _requests) = setup(MemoryStore::new());
    service
        .start_conversation("drill", "seller", "renter", "renter", "hi")
        .await
        .unwrap();
    store.remove_listing("drill");

    let mut feed = service.list_conversations("renter").unwrap();
    let state = wait_feed(&mut feed, |s| {
        s.items.len() == 1 && !s.items[0].title.is_loading() && !s.items[0].thumbnail.is_loading()
    })
    .await;
    assert_eq!(
        state.items[0].title,
        DisplayText::Fallback("Unknown listing".to_string())
    );
    assert_eq!(state.items[0].thumbnail_url(), "");
}

#[tokio::test]
async fn test_notification_sent_to_recipient() {
    let (service, _, mut requests) = setup(MemoryStore::new());
    let (_, first) = service
        .start_conversation("drill", "seller", "renter", "renter", "Is it free Saturday?")
        .await
        .unwrap();

    let request = next_request(&mut requests).await;
    assert_eq!(request.recipient_id, "seller");
    assert_eq!(request.recipient_token, "seller-device");
    assert_eq!(request.title, "Rae Renter");
    assert_eq!(request.body, "Is it free Saturday?");
    assert_eq!(request.message_id, first.message_id);
    assert_no_request(&mut requests).await;
}

#[tokio::test]
async fn test_no_notification_without_token() {
    let (service, store, mut requests) = setup(MemoryStore::new());
    store.put_user(User::new("seller", "Sam Seller"));

    service
        .start_conversation("drill", "seller", "renter", "renter", "hello")
        .await
        .unwrap();
    assert_no_request(&mut requests).await;
}

#[tokio::test]
async fn test_no_notification_while_recipient_is_viewing() {
    let (service, _, mut requests) = setup(MemoryStore::new());
    let (conversation, _) = service
        .start_conversation("drill", "seller", "renter", "renter", "hello")
        .await
        .unwrap();
    next_request(&mut requests).await;

    let view = service
        .open_conversation(&conversation.conversation_id, "seller")
        .await
        .unwrap();
    assert!(service.is_viewing(&conversation.conversation_id, "seller"));
    service
        .send_message(&conversation.conversation_id, "renter", "are you there?")
        .await
        .unwrap();
    assert_no_request(&mut requests).await;

    service.close_conversation(view);
    assert!(!service.is_viewing(&conversation.conversation_id, "seller"));
    service
        .send_message(&conversation.conversation_id, "renter", "ping")
        .await
        .unwrap();
    assert_eq!(next_request(&mut requests).await.body, "ping");
}

#[tokio::test]
async fn test_closed_view_callback_never_fires() {
    let (service, _, _requests) = setup(MemoryStore::new());
    let (conversation, _) = service
        .start_conversation("drill", "seller", "renter", "renter", "hello")
        .await
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let view = service
        .open_conversation_with(&conversation.conversation_id, "seller", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    timeout(Duration::from_secs(2), async {
        while seen.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    service.close_conversation(view);
    service
        .send_message(&conversation.conversation_id, "renter", "after close")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_requires_participant() {
    let (service, _, _requests) = setup(MemoryStore::new());
    let (conversation, _) = service
        .start_conversation("drill", "seller", "renter", "renter", "hello")
        .await
        .unwrap();

    assert!(matches!(
        service
            .open_conversation(&conversation.conversation_id, "stranger")
            .await,
        Err(ChatError::Validation(_))
    ));
    assert!(matches!(
        service.open_conversation("missing", "renter").await,
        Err(ChatError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_health_reports_reconnecting_views() {
    let (service, store, _requests) = setup(MemoryStore::new());
    service
        .start_conversation("drill", "seller", "renter", "renter", "hello")
        .await
        .unwrap();

    let mut feed = service.list_conversations("renter").unwrap();
    wait_feed(&mut feed, |s| s.status == IndexStatus::Live).await;
    assert!(service.health().is_healthy());

    store.fail_next_subscribes(20);
    store.interrupt_subscriptions();
    let state = wait_feed(&mut feed, |s| matches!(s.status, IndexStatus::Reconnecting { .. })).await;
    assert_eq!(state.items.len(), 1, "Last known list should be kept");
    assert!(!service.health().is_healthy());

    wait_feed(&mut feed, |s| s.status == IndexStatus::Live).await;
    timeout(Duration::from_secs(2), async {
        while !service.health().is_healthy() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_non_transactional_store_keeps_summary_current() {
    let (service, store, _requests) = setup(MemoryStore::non_transactional());
    let (conversation, message) = service
        .start_conversation("drill", "seller", "renter", "renter", "hello")
        .await
        .unwrap();
    assert_eq!(conversation.last_message, "hello");
    assert_eq!(conversation.last_message_timestamp, message.timestamp);

    let stored = store
        .get_conversation(&conversation.conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_message, "hello");
}
