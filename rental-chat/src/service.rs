//! Caller-facing API for presentation layers.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::dispatch::{build_dispatch, DispatchLedger, NotificationDispatcher};
use crate::enricher::ConversationEnricher;
use crate::error::{ChatError, Result};
use crate::feed::ConversationFeed;
use crate::index::ConversationIndex;
use crate::live::{Backoff, Health, HealthMonitor};
use crate::models::{Conversation, Message};
use crate::store::EntityStore;
use crate::stream::{validate_append, MessageStream, MessageStreamHandle};

const DEFAULT_NOTIFICATION_TITLE: &str = "New message";

/// Who currently has which conversation open.
#[derive(Debug, Default)]
pub struct ActiveViewers {
    /// conversation_id -> viewer_id -> open views
    open: DashMap<String, HashMap<String, usize>>,
}

impl ActiveViewers {
    pub fn is_viewing(&self, conversation_id: &str, viewer_id: &str) -> bool {
        self.open
            .get(conversation_id)
            .map(|viewers| viewers.get(viewer_id).copied().unwrap_or(0) > 0)
            .unwrap_or(false)
    }

    fn enter(self: &Arc<Self>, conversation_id: &str, viewer_id: &str) -> ViewerGuard {
        *self
            .open
            .entry(conversation_id.to_string())
            .or_default()
            .entry(viewer_id.to_string())
            .or_insert(0) += 1;
        ViewerGuard {
            viewers: self.clone(),
            conversation_id: conversation_id.to_string(),
            viewer_id: viewer_id.to_string(),
        }
    }

    fn leave(&self, conversation_id: &str, viewer_id: &str) {
        if let Some(mut viewers) = self.open.get_mut(conversation_id) {
            if let Some(count) = viewers.get_mut(viewer_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    viewers.remove(viewer_id);
                }
            }
            if viewers.is_empty() {
                drop(viewers);
                self.open.remove_if(conversation_id, |_, v| v.is_empty());
            }
        }
    }
}

struct ViewerGuard {
    viewers: Arc<ActiveViewers>,
    conversation_id: String,
    viewer_id: String,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.viewers.leave(&self.conversation_id, &self.viewer_id);
    }
}

/// One participant's open conversation.
pub struct ConversationView {
    stream: MessageStreamHandle,
    viewer: ViewerGuard,
}

impl ConversationView {
    pub fn conversation_id(&self) -> &str {
        self.stream.conversation_id()
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer.viewer_id
    }

    /// Next message in store order; the caller scrolls to it.
    pub async fn recv(&mut self) -> Option<Message> {
        self.stream.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.stream.try_recv()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}

pub struct ChatService<S, D> {
    store: Arc<S>,
    dispatcher: Arc<D>,
    index: ConversationIndex<S>,
    stream: MessageStream<S>,
    ledger: Arc<DispatchLedger>,
    viewers: Arc<ActiveViewers>,
    health: Arc<HealthMonitor>,
    backoff: Backoff,
    notify_body_max: usize,
}

impl<S: EntityStore, D: NotificationDispatcher> ChatService<S, D> {
    pub fn new(store: Arc<S>, dispatcher: Arc<D>, config: &ChatConfig) -> Self {
        let health = Arc::new(HealthMonitor::new());
        Self {
            index: ConversationIndex::new(store.clone(), config.backoff, health.clone()),
            stream: MessageStream::new(
                store.clone(),
                config.backoff,
                config.append_retries,
                config.summary_retries,
                health.clone(),
            ),
            store,
            dispatcher,
            ledger: Arc::new(DispatchLedger::new()),
            viewers: Arc::new(ActiveViewers::default()),
            health,
            backoff: config.backoff,
            notify_body_max: config.notify_body_max,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Live, recency-ordered summaries of the viewer's conversations.
    pub fn list_conversations(&self, viewer_id: &str) -> Result<ConversationFeed> {
        let index = self.index.subscribe(viewer_id)?;
        let enricher = ConversationEnricher::new(self.store.clone(), viewer_id.trim(), self.backoff);
        Ok(ConversationFeed::start(index, enricher))
    }

    /// Open a conversation for reading. Messages arrive on the view.
    pub async fn open_conversation(
        &self,
        conversation_id: &str,
        viewer_id: &str,
    ) -> Result<ConversationView> {
        let guard = self.enter(conversation_id, viewer_id).await?;
        let stream = self.stream.subscribe(conversation_id).await?;
        Ok(ConversationView {
            stream,
            viewer: guard,
        })
    }

    /// Open a conversation, calling `on_message` for each message in order.
    pub async fn open_conversation_with<F>(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        on_message: F,
    ) -> Result<ConversationView>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let guard = self.enter(conversation_id, viewer_id).await?;
        let stream = self.stream.subscribe_with(conversation_id, on_message).await?;
        Ok(ConversationView {
            stream,
            viewer: guard,
        })
    }

    pub fn close_conversation(&self, view: ConversationView) {
        debug!(
            "{} closed conversation {}",
            view.viewer_id(),
            view.conversation_id()
        );
        drop(view);
    }

    /// Append a message and request a notification for the other
    /// participant. Notification failures never fail the send.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<Message> {
        let (message, conversation) = self.stream.append(conversation_id, sender_id, text).await?;
        self.spawn_notification(message.clone(), conversation);
        Ok(message)
    }

    /// Send the first message between two users about a listing, creating
    /// their conversation if it does not exist yet.
    pub async fn start_conversation(
        &self,
        product_id: &str,
        seller_id: &str,
        renter_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<(Conversation, Message)> {
        let (product_id, seller_id, renter_id) =
            (product_id.trim(), seller_id.trim(), renter_id.trim());
        if product_id.is_empty() || seller_id.is_empty() || renter_id.is_empty() {
            return Err(ChatError::validation(
                "product, seller and renter ids are required",
            ));
        }
        if seller_id == renter_id {
            return Err(ChatError::validation(
                "seller and renter must be different users",
            ));
        }

        let draft = Conversation::new(product_id, seller_id, renter_id);
        validate_append(&draft, sender_id, text)?;

        let conversation = self.store.create_conversation(draft).await?;
        info!(
            conversation_id = %conversation.conversation_id,
            "{} started a conversation about {}",
            sender_id,
            product_id
        );
        let message = self
            .send_message(&conversation.conversation_id, sender_id, text)
            .await?;
        let conversation = self
            .store
            .get_conversation(&conversation.conversation_id)
            .await?
            .unwrap_or(conversation);
        Ok((conversation, message))
    }

    /// Connectivity of the live views; only reported when asked.
    pub fn health(&self) -> Health {
        self.health.snapshot()
    }

    pub fn is_viewing(&self, conversation_id: &str, viewer_id: &str) -> bool {
        self.viewers.is_viewing(conversation_id, viewer_id)
    }

    async fn enter(&self, conversation_id: &str, viewer_id: &str) -> Result<ViewerGuard> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound {
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
        if !conversation.is_participant(viewer_id) {
            return Err(ChatError::validation(format!(
                "{} is not a participant of {}",
                viewer_id, conversation_id
            )));
        }
        Ok(self.viewers.enter(conversation_id, viewer_id))
    }

    fn spawn_notification(&self, message: Message, conversation: Conversation) -> JoinHandle<()> {
        let notifier = Notifier {
            store: self.store.clone(),
            dispatcher: self.dispatcher.clone(),
            ledger: self.ledger.clone(),
            viewers: self.viewers.clone(),
            body_max: self.notify_body_max,
        };
        tokio::spawn(async move { notifier.notify(message, conversation).await })
    }
}

/// Everything a detached notification task needs.
struct Notifier<S, D> {
    store: Arc<S>,
    dispatcher: Arc<D>,
    ledger: Arc<DispatchLedger>,
    viewers: Arc<ActiveViewers>,
    body_max: usize,
}

impl<S: EntityStore, D: NotificationDispatcher> Notifier<S, D> {
    async fn notify(&self, message: Message, conversation: Conversation) {
        let Some(recipient_id) = conversation.other_participant(&message.sender_id) else {
            return;
        };
        if self
            .viewers
            .is_viewing(&conversation.conversation_id, recipient_id)
        {
            debug!(
                "{} is viewing {}, no notification",
                recipient_id, conversation.conversation_id
            );
            return;
        }

        let recipient = match self.store.get_user(recipient_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!("Recipient {} unknown, no notification", recipient_id);
                return;
            }
            Err(e) => {
                warn!("Could not load recipient {}: {}", recipient_id, e);
                return;
            }
        };

        let title = self.title_for(&conversation, &message).await;
        let Some(request) = build_dispatch(&message, &recipient, &title, self.body_max) else {
            debug!("{} has no device token, no notification", recipient_id);
            return;
        };
        if !self.ledger.first_dispatch(&message.message_id) {
            debug!("Notification for {} already dispatched", message.message_id);
            return;
        }
        if let Err(e) = self.dispatcher.dispatch(request).await {
            warn!(
                "Notification for {} to {} failed: {}",
                message.message_id, recipient_id, e
            );
        }
    }

    /// Sender's name, else the listing title, else a generic label.
    async fn title_for(&self, conversation: &Conversation, message: &Message) -> String {
        if let Ok(Some(sender)) = self.store.get_user(&message.sender_id).await {
            if !sender.full_name.trim().is_empty() {
                return sender.full_name;
            }
        }
        if let Ok(Some(listing)) = self.store.get_listing(&conversation.product_id).await {
            return listing.title;
        }
        DEFAULT_NOTIFICATION_TITLE.to_string()
    }
}
