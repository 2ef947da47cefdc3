//! The conversation list a presentation layer renders: the index order
//! joined with enriched summaries.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::enricher::ConversationEnricher;
use crate::index::{IndexHandle, IndexState, IndexStatus};
use crate::live::{EpochTicket, SubscriptionEpoch};
use crate::models::ConversationSummary;
use crate::store::EntityStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedState {
    pub status: IndexStatus,
    /// Same order as the conversation index
    pub items: Vec<ConversationSummary>,
}

/// Live list of conversation summaries. Dropping it cancels the index
/// subscription and every enrichment lookup.
pub struct ConversationFeed {
    rx: watch::Receiver<FeedState>,
    epoch: SubscriptionEpoch,
    task: JoinHandle<()>,
}

impl ConversationFeed {
    pub(crate) fn start<S: EntityStore>(index: IndexHandle, enricher: ConversationEnricher<S>) -> Self {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let enricher = enricher.with_change_listener(dirty_tx);
        let initial = index.current();
        let (tx, rx) = watch::channel(FeedState {
            status: initial.status.clone(),
            items: Vec::new(),
        });
        let epoch = SubscriptionEpoch::new();
        let task = tokio::spawn(run_feed(index, enricher, dirty_rx, tx, epoch.ticket()));
        Self { rx, epoch, task }
    }

    pub fn current(&self) -> FeedState {
        self.rx.borrow().clone()
    }

    /// Like [`current`](Self::current), but the returned state counts as
    /// seen: [`changed`](Self::changed) waits for a newer one.
    pub fn latest(&mut self) -> FeedState {
        self.rx.borrow_and_update().clone()
    }

    /// Wait for the next change. `None` once the feed has stopped.
    pub async fn changed(&mut self) -> Option<FeedState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&FeedState) -> bool,
    ) -> Option<FeedState> {
        self.rx
            .wait_for(|state| predicate(state))
            .await
            .ok()
            .map(|state| (*state).clone())
    }
}

impl Drop for ConversationFeed {
    fn drop(&mut self) {
        self.epoch.cancel();
        self.task.abort();
    }
}

async fn run_feed<S: EntityStore>(
    mut index: IndexHandle,
    enricher: ConversationEnricher<S>,
    mut dirty: mpsc::UnboundedReceiver<String>,
    tx: watch::Sender<FeedState>,
    ticket: EpochTicket,
) {
    let mut state = index.current();
    resolve_all(&enricher, &state);

    loop {
        tokio::select! {
            next = index.changed() => match next {
                Some(next) => {
                    state = next;
                    resolve_all(&enricher, &state);
                }
                None => return,
            },
            Some(_) = dirty.recv() => {
                while dirty.try_recv().is_ok() {}
            }
        }

        if !ticket.is_current() {
            return;
        }
        let items = state
            .conversations
            .iter()
            .filter_map(|c| enricher.summary(&c.conversation_id))
            .collect();
        tx.send_replace(FeedState {
            status: state.status.clone(),
            items,
        });
    }
}

fn resolve_all<S: EntityStore>(enricher: &ConversationEnricher<S>, state: &IndexState) {
    for conversation in &state.conversations {
        if let Err(e) = enricher.resolve(conversation.clone()) {
            warn!(
                "Skipping enrichment of {}: {}",
                conversation.conversation_id, e
            );
        }
    }
}
