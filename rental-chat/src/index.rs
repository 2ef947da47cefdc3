//! Conversation Index: the live, recency-ordered list of conversations a
//! viewer participates in.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::live::{Backoff, EpochTicket, HealthMonitor, SubscriptionEpoch};
use crate::models::Conversation;
use crate::store::{Change, EntityStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IndexStatus {
    /// No snapshot received yet
    Loading,
    Live,
    /// The store subscription broke; the list is the last known good one.
    Reconnecting { attempt: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexState {
    pub status: IndexStatus,
    /// Most recent first, ties by ascending id
    pub conversations: Vec<Conversation>,
}

impl IndexState {
    fn loading() -> Self {
        Self {
            status: IndexStatus::Loading,
            conversations: Vec::new(),
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.conversations
            .iter()
            .map(|c| c.conversation_id.as_str())
            .collect()
    }
}

/// Conversations keyed by id. Conversations are never deleted, so a
/// snapshot merges into what is known instead of replacing it.
#[derive(Debug, Default)]
struct KnownConversations {
    by_id: HashMap<String, Conversation>,
}

impl KnownConversations {
    fn apply(&mut self, change: Change<Conversation>) {
        match change {
            Change::Snapshot(items) => items.into_iter().for_each(|c| self.upsert(c)),
            Change::Upsert(conversation) => self.upsert(conversation),
        }
    }

    /// Keep whichever copy carries the later last message.
    fn upsert(&mut self, conversation: Conversation) {
        match self.by_id.get(&conversation.conversation_id) {
            Some(known)
                if known.last_message_timestamp > conversation.last_message_timestamp => {}
            _ => {
                self.by_id
                    .insert(conversation.conversation_id.clone(), conversation);
            }
        }
    }

    fn ordered(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.by_id.values().cloned().collect();
        list.sort_by(Conversation::recency_cmp);
        list
    }
}

pub struct ConversationIndex<S> {
    store: Arc<S>,
    backoff: Backoff,
    health: Arc<HealthMonitor>,
}

impl<S: EntityStore> ConversationIndex<S> {
    pub fn new(store: Arc<S>, backoff: Backoff, health: Arc<HealthMonitor>) -> Self {
        Self {
            store,
            backoff,
            health,
        }
    }

    /// Start following the conversations of `viewer_id`.
    pub fn subscribe(&self, viewer_id: &str) -> Result<IndexHandle> {
        let viewer_id = viewer_id.trim();
        if viewer_id.is_empty() {
            return Err(ChatError::validation("viewer id is empty"));
        }

        let (tx, rx) = watch::channel(IndexState::loading());
        let epoch = SubscriptionEpoch::new();
        let view = self.health.register();

        let task = tokio::spawn(follow_conversations(
            self.store.clone(),
            viewer_id.to_string(),
            self.backoff,
            tx,
            epoch.ticket(),
            self.health.clone(),
            view,
        ));

        Ok(IndexHandle {
            rx,
            epoch,
            task,
            health: self.health.clone(),
            view,
        })
    }
}

async fn follow_conversations<S: EntityStore>(
    store: Arc<S>,
    viewer_id: String,
    backoff: Backoff,
    tx: watch::Sender<IndexState>,
    ticket: EpochTicket,
    health: Arc<HealthMonitor>,
    view: u64,
) {
    let mut known = KnownConversations::default();
    let mut failures: u32 = 0;

    loop {
        let reason = match store.subscribe_conversations(&viewer_id).await {
            Ok(mut sub) => {
                debug!("Conversation subscription open for {}", viewer_id);
                loop {
                    match sub.next().await {
                        Some(Ok(change)) => {
                            if !ticket.is_current() {
                                return;
                            }
                            if failures > 0 {
                                info!("Conversation list for {} recovered", viewer_id);
                                health.clear(view);
                            }
                            failures = 0;
                            known.apply(change);
                            tx.send_replace(IndexState {
                                status: IndexStatus::Live,
                                conversations: known.ordered(),
                            });
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "subscription closed".to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        if !ticket.is_current() || tx.is_closed() {
            return;
        }

        let delay = backoff.delay(failures);
        failures = failures.saturating_add(1);
        health.record_failure(view, failures);
        warn!(
            viewer_id = %viewer_id,
            attempt = failures,
            "Conversation subscription failed ({}), retrying in {:?}",
            reason,
            delay
        );
        tx.send_modify(|state| {
            state.status = IndexStatus::Reconnecting {
                attempt: failures,
                reason,
            }
        });
        tokio::time::sleep(delay).await;
    }
}

/// Live view of one viewer's conversations. Dropping it unsubscribes.
pub struct IndexHandle {
    rx: watch::Receiver<IndexState>,
    epoch: SubscriptionEpoch,
    task: JoinHandle<()>,
    health: Arc<HealthMonitor>,
    view: u64,
}

impl IndexHandle {
    pub fn current(&self) -> IndexState {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. `None` once the view has stopped.
    pub async fn changed(&mut self) -> Option<IndexState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&IndexState) -> bool,
    ) -> Option<IndexState> {
        self.rx
            .wait_for(|state| predicate(state))
            .await
            .ok()
            .map(|state| (*state).clone())
    }
}

impl Drop for IndexHandle {
    fn drop(&mut self) {
        self.epoch.cancel();
        self.task.abort();
        self.health.clear(self.view);
    }
}
