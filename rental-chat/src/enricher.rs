//! Conversation Enricher: joins each conversation with its listing and the
//! counterpart user to produce display-ready summaries.
//!
//! Every conversation gets its own resolution task with two lookup tasks
//! racing underneath it, so a slow or failing lookup only ever affects the
//! field it feeds, and only in that one conversation.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ChatError, Result, StoreResult};
use crate::live::{Backoff, EpochTicket, SubscriptionEpoch};
use crate::models::{Conversation, ConversationSummary, Listing, User};
use crate::store::{EntityStore, Subscription};

enum LookupEvent {
    Listing(Option<Listing>),
    User(Option<User>),
}

/// An active resolution: the cache entry for one conversation.
struct Resolution {
    summary: watch::Receiver<ConversationSummary>,
    conversation: watch::Sender<Conversation>,
    epoch: SubscriptionEpoch,
    task: JoinHandle<()>,
}

impl Drop for Resolution {
    fn drop(&mut self) {
        self.epoch.cancel();
        self.task.abort();
    }
}

/// Aborts the lookup tasks when the owning resolution task goes away.
struct LookupTasks(Vec<JoinHandle<()>>);

impl Drop for LookupTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Summary cache for one viewer, keyed by conversation id.
pub struct ConversationEnricher<S> {
    store: Arc<S>,
    viewer_id: String,
    backoff: Backoff,
    entries: DashMap<String, Resolution>,
    /// Receives the id of every conversation whose summary changed
    listener: Option<mpsc::UnboundedSender<String>>,
}

impl<S: EntityStore> ConversationEnricher<S> {
    pub fn new(store: Arc<S>, viewer_id: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            store,
            viewer_id: viewer_id.into(),
            backoff,
            entries: DashMap::new(),
            listener: None,
        }
    }

    pub fn with_change_listener(mut self, listener: mpsc::UnboundedSender<String>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Live summary of `conversation` for this enricher's viewer.
    ///
    /// Calling again for a conversation that is already being resolved
    /// refreshes the conversation fields without restarting the lookups.
    pub fn resolve(
        &self,
        conversation: Conversation,
    ) -> Result<watch::Receiver<ConversationSummary>> {
        let other_id = conversation
            .other_participant(&self.viewer_id)
            .ok_or_else(|| {
                ChatError::validation(format!(
                    "{} is not a participant of {}",
                    self.viewer_id, conversation.conversation_id
                ))
            })?
            .to_string();

        if let Some(existing) = self.entries.get(&conversation.conversation_id) {
            existing.conversation.send_if_modified(|current| {
                let newer = conversation.last_message_timestamp >= current.last_message_timestamp
                    && conversation != *current;
                if newer {
                    *current = conversation.clone();
                }
                newer
            });
            return Ok(existing.summary.clone());
        }

        let initial = ConversationSummary::project(&conversation, &self.viewer_id, None, None);
        let (summary_tx, summary_rx) = watch::channel(initial);
        let (conversation_tx, conversation_rx) = watch::channel(conversation.clone());
        let epoch = SubscriptionEpoch::new();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let lookups = LookupTasks(vec![
            tokio::spawn(follow_record(
                "listing",
                conversation.product_id.clone(),
                self.backoff,
                {
                    let store = self.store.clone();
                    let product_id = conversation.product_id.clone();
                    move || {
                        let store = store.clone();
                        let product_id = product_id.clone();
                        async move { store.subscribe_listing(&product_id).await }
                    }
                },
                events_tx.clone(),
                LookupEvent::Listing,
            )),
            tokio::spawn(follow_record(
                "user",
                other_id.clone(),
                self.backoff,
                {
                    let store = self.store.clone();
                    let uid = other_id;
                    move || {
                        let store = store.clone();
                        let uid = uid.clone();
                        async move { store.subscribe_user(&uid).await }
                    }
                },
                events_tx,
                LookupEvent::User,
            )),
        ]);

        let task = tokio::spawn(run_resolution(
            self.viewer_id.clone(),
            conversation_rx,
            events_rx,
            summary_tx,
            epoch.ticket(),
            self.listener.clone(),
            lookups,
        ));

        self.entries.insert(
            conversation.conversation_id.clone(),
            Resolution {
                summary: summary_rx.clone(),
                conversation: conversation_tx,
                epoch,
                task,
            },
        );
        if let Some(listener) = &self.listener {
            let _ = listener.send(conversation.conversation_id);
        }
        Ok(summary_rx)
    }

    /// Latest cached summary, if the conversation is being resolved.
    pub fn summary(&self, conversation_id: &str) -> Option<ConversationSummary> {
        self.entries
            .get(conversation_id)
            .map(|entry| entry.summary.borrow().clone())
    }

    /// Stop resolving a conversation and drop its cache entry.
    pub fn forget(&self, conversation_id: &str) {
        self.entries.remove(conversation_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

async fn run_resolution(
    viewer_id: String,
    mut conversation_rx: watch::Receiver<Conversation>,
    mut events: mpsc::UnboundedReceiver<LookupEvent>,
    summary_tx: watch::Sender<ConversationSummary>,
    ticket: EpochTicket,
    listener: Option<mpsc::UnboundedSender<String>>,
    _lookups: LookupTasks,
) {
    let mut conversation = conversation_rx.borrow_and_update().clone();
    let mut listing: Option<Option<Listing>> = None;
    let mut user: Option<Option<User>> = None;
    let mut lookups_open = true;

    loop {
        tokio::select! {
            event = events.recv(), if lookups_open => match event {
                Some(LookupEvent::Listing(value)) => listing = Some(value),
                Some(LookupEvent::User(value)) => user = Some(value),
                None => {
                    lookups_open = false;
                    continue;
                }
            },
            changed = conversation_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                conversation = conversation_rx.borrow_and_update().clone();
            }
        }

        if !ticket.is_current() {
            return;
        }
        let summary = ConversationSummary::project(
            &conversation,
            &viewer_id,
            listing.as_ref().map(Option::as_ref),
            user.as_ref().map(Option::as_ref),
        );
        summary_tx.send_replace(summary);
        if let Some(listener) = &listener {
            let _ = listener.send(conversation.conversation_id.clone());
        }
    }
}

/// Follow one keyed record until it is found missing.
///
/// Transient failures resubscribe with backoff; a `None` from the store is
/// terminal and ends the lookup.
async fn follow_record<T, F, Fut>(
    kind: &'static str,
    key: String,
    backoff: Backoff,
    mut subscribe: F,
    tx: mpsc::UnboundedSender<LookupEvent>,
    wrap: fn(Option<T>) -> LookupEvent,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<Subscription<Option<T>>>>,
{
    let mut attempt: u32 = 0;
    loop {
        match subscribe().await {
            Ok(mut sub) => {
                while let Some(item) = sub.next().await {
                    match item {
                        Ok(Some(record)) => {
                            attempt = 0;
                            if tx.send(wrap(Some(record))).is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!("{} '{}' not found, using fallback", kind, key);
                            let _ = tx.send(wrap(None));
                            return;
                        }
                        Err(e) => {
                            warn!("{} '{}' lookup interrupted: {}", kind, key, e);
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("{} '{}' lookup failed: {}", kind, key, e),
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(backoff.delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}
