//! Message Stream: the ordered, append-only message feed of one open
//! conversation, and the append (send) path that feeds it.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result, StoreError};
use crate::live::{Backoff, EpochTicket, HealthMonitor, SubscriptionEpoch};
use crate::models::{Conversation, Message, MessageDraft};
use crate::store::{Change, EntityStore};

/// Maximum message length in characters
pub const MAX_MESSAGE_CHARS: usize = 10_000;

type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Where a stream delivers its messages.
enum Delivery {
    Channel(mpsc::UnboundedSender<Message>),
    Callback(Callback),
}

impl Delivery {
    /// Returns false once the consumer is gone.
    fn deliver(&self, message: &Message) -> bool {
        match self {
            Delivery::Channel(tx) => tx.send(message.clone()).is_ok(),
            Delivery::Callback(callback) => {
                callback(message);
                true
            }
        }
    }
}

/// Serializes delivery against [`MessageStreamHandle::close`]: once `shut`
/// returns, no delivery is in progress and none will start.
#[derive(Clone, Default)]
struct DeliveryGate(Arc<Mutex<bool>>);

impl DeliveryGate {
    fn shut(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Runs `deliver` unless the gate is shut. Returns false if it was
    /// shut or `deliver` returned false.
    fn pass(&self, deliver: impl FnOnce() -> bool) -> bool {
        let shut = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        !*shut && deliver()
    }
}

/// Checks an append request and returns the trimmed text.
pub fn validate_append<'a>(
    conversation: &Conversation,
    sender_id: &str,
    text: &'a str,
) -> Result<&'a str> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::validation("message text is empty"));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::validation(format!(
            "message too long (max {} characters)",
            MAX_MESSAGE_CHARS
        )));
    }
    if !conversation.is_participant(sender_id) {
        return Err(ChatError::validation(format!(
            "{} is not a participant of {}",
            sender_id, conversation.conversation_id
        )));
    }
    Ok(text)
}

pub struct MessageStream<S> {
    store: Arc<S>,
    backoff: Backoff,
    append_retries: u32,
    summary_retries: u32,
    health: Arc<HealthMonitor>,
}

impl<S: EntityStore> MessageStream<S> {
    pub fn new(
        store: Arc<S>,
        backoff: Backoff,
        append_retries: u32,
        summary_retries: u32,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            store,
            backoff,
            append_retries,
            summary_retries,
            health,
        }
    }

    /// Follow a conversation; messages are read from the returned handle.
    pub async fn subscribe(&self, conversation_id: &str) -> Result<MessageStreamHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handle = self.start(conversation_id, Delivery::Channel(tx)).await?;
        handle.rx = Some(rx);
        Ok(handle)
    }

    /// Follow a conversation, invoking `callback` for every message in
    /// order. The callback never fires after [`close`](MessageStreamHandle::close)
    /// returns; `close` waits for a callback already running. The callback
    /// must therefore not close or drop its own handle.
    pub async fn subscribe_with<F>(
        &self,
        conversation_id: &str,
        callback: F,
    ) -> Result<MessageStreamHandle>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.start(conversation_id, Delivery::Callback(Arc::new(callback)))
            .await
    }

    async fn start(&self, conversation_id: &str, delivery: Delivery) -> Result<MessageStreamHandle> {
        let conversation = self.load(conversation_id).await?;
        let epoch = SubscriptionEpoch::new();
        let gate = DeliveryGate::default();
        let view = self.health.register();

        let task = tokio::spawn(follow_messages(
            self.store.clone(),
            conversation.conversation_id.clone(),
            self.backoff,
            delivery,
            gate.clone(),
            epoch.ticket(),
            self.health.clone(),
            view,
        ));

        Ok(MessageStreamHandle {
            conversation_id: conversation.conversation_id,
            rx: None,
            epoch,
            gate,
            task,
            health: self.health.clone(),
            view,
            closed: false,
        })
    }

    /// Append a message and bring the conversation summary up to date.
    ///
    /// The store assigns the timestamp. A write that fails on connectivity
    /// is retried with backoff under one idempotency key, so a write that
    /// landed before its reply was lost is not stored twice. On stores
    /// without transactional appends the conversation update is retried a
    /// bounded number of times; if it still fails the next append catches
    /// it up.
    pub async fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<(Message, Conversation)> {
        let mut conversation = self.load(conversation_id).await?;
        let text = validate_append(&conversation, sender_id, text)?;

        let draft = MessageDraft::new(&conversation.conversation_id, sender_id, text);
        let message = self.append_message(draft).await?;
        debug!(
            conversation_id = %message.conversation_id,
            seq = message.seq,
            "Message appended"
        );

        if self.store.is_transactional() {
            conversation.last_message = message.text.clone();
            conversation.last_message_timestamp = message.timestamp;
        } else if let Some(updated) = self.record_last_message(&message).await {
            conversation = updated;
        }
        Ok((message, conversation))
    }

    async fn append_message(&self, draft: MessageDraft) -> Result<Message> {
        let attempts = self.append_retries.max(1);
        let mut attempt = 0;
        loop {
            match self.store.append_message(draft.clone()).await {
                Ok(message) => return Ok(message),
                Err(StoreError::Unavailable(reason)) if attempt + 1 < attempts => {
                    let delay = self.backoff.delay(attempt);
                    debug!(
                        conversation_id = %draft.conversation_id,
                        key = %draft.idempotency_key,
                        "Message write failed ({}), retrying in {:?}",
                        reason,
                        delay
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        conversation_id = %draft.conversation_id,
                        "Message write failed after {} attempts: {}",
                        attempt + 1,
                        e
                    );
                    return Err(e.into());
                }
            }
        }
    }

    async fn record_last_message(&self, message: &Message) -> Option<Conversation> {
        let attempts = self.summary_retries.max(1);
        for attempt in 0..attempts {
            match self.store.record_last_message(message).await {
                Ok(conversation) => return Some(conversation),
                Err(e) if attempt + 1 < attempts => {
                    let delay = self.backoff.delay(attempt);
                    debug!(
                        "Conversation update for {} failed ({}), retrying in {:?}",
                        message.message_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        conversation_id = %message.conversation_id,
                        "Giving up on conversation update for {} after {} attempts: {}",
                        message.message_id,
                        attempts,
                        e
                    );
                }
            }
        }
        None
    }

    async fn load(&self, conversation_id: &str) -> Result<Conversation> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound {
                entity: "conversation",
                id: conversation_id.to_string(),
            })
    }
}

async fn follow_messages<S: EntityStore>(
    store: Arc<S>,
    conversation_id: String,
    backoff: Backoff,
    delivery: Delivery,
    gate: DeliveryGate,
    ticket: EpochTicket,
    health: Arc<HealthMonitor>,
    view: u64,
) {
    // Highest sequence number handed to the consumer; anything at or below
    // it is a replay from a resubscribe snapshot.
    let mut delivered: u64 = 0;
    let mut failures: u32 = 0;

    loop {
        let reason = match store.subscribe_messages(&conversation_id).await {
            Ok(mut sub) => loop {
                match sub.next().await {
                    Some(Ok(change)) => {
                        if failures > 0 {
                            info!("Message stream for {} recovered", conversation_id);
                            health.clear(view);
                            failures = 0;
                        }
                        let batch = match change {
                            Change::Snapshot(messages) => messages,
                            Change::Upsert(message) => vec![message],
                        };
                        for message in batch {
                            if message.seq <= delivered {
                                continue;
                            }
                            if !gate.pass(|| ticket.is_current() && delivery.deliver(&message)) {
                                return;
                            }
                            delivered = message.seq;
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "subscription closed".to_string(),
                }
            },
            Err(e) => e.to_string(),
        };

        if !ticket.is_current() {
            return;
        }
        let delay = backoff.delay(failures);
        failures = failures.saturating_add(1);
        health.record_failure(view, failures);
        warn!(
            conversation_id = %conversation_id,
            attempt = failures,
            "Message subscription failed ({}), retrying in {:?}",
            reason,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}

/// An open conversation. Dropping or closing it cancels the subscription.
pub struct MessageStreamHandle {
    conversation_id: String,
    rx: Option<mpsc::UnboundedReceiver<Message>>,
    epoch: SubscriptionEpoch,
    gate: DeliveryGate,
    task: JoinHandle<()>,
    health: Arc<HealthMonitor>,
    view: u64,
    closed: bool,
}

impl MessageStreamHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Next message in store order. Always `None` for callback streams and
    /// after [`close`](Self::close).
    pub async fn recv(&mut self) -> Option<Message> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    /// Stop delivery. Results still in flight are discarded.
    pub fn close(&mut self) {
        self.gate.shut();
        self.epoch.cancel();
        self.task.abort();
        self.rx = None;
        self.closed = true;
        self.health.clear(self.view);
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.task.is_finished()
    }
}

impl Drop for MessageStreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}
