//! Notification requests for new messages.
//!
//! Delivery itself belongs to an external dispatcher; this module decides
//! whether a request is needed, builds it, and makes sure each message is
//! handed over at most once.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{ChatError, Result};
use crate::models::{Message, User};

/// How many message ids the ledger remembers
const MAX_LEDGER_ENTRIES: usize = 10_000;

const ELLIPSIS: char = '…';

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRequest {
    pub message_id: String,
    pub conversation_id: String,
    pub recipient_id: String,
    pub recipient_token: String,
    pub title: String,
    pub body: String,
}

/// Build the request for `message`, or `None` when the recipient has no
/// registered device token.
pub fn build_dispatch(
    message: &Message,
    recipient: &User,
    title: &str,
    body_max_chars: usize,
) -> Option<DispatchRequest> {
    let token = recipient
        .device_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())?;

    Some(DispatchRequest {
        message_id: message.message_id.clone(),
        conversation_id: message.conversation_id.clone(),
        recipient_id: recipient.uid.clone(),
        recipient_token: token.to_string(),
        title: title.to_string(),
        body: truncate_body(&message.text, body_max_chars),
    })
}

/// Cut `text` to at most `max_chars` characters, ending with an ellipsis
/// when shortened. Counts chars, so multi-byte text never splits.
pub fn truncate_body(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(1);
    let mut body: String = text.chars().take(keep).collect();
    body.truncate(body.trim_end().len());
    body.push(ELLIPSIS);
    body
}

/// Delivery backend for push notifications. Failures are the dispatcher's
/// to log; callers do not retry.
pub trait NotificationDispatcher: Send + Sync + 'static {
    fn dispatch(&self, request: DispatchRequest) -> impl Future<Output = Result<()>> + Send;
}

/// Writes requests to the log. Used when no push transport is configured.
#[derive(Debug, Default)]
pub struct LogDispatcher;

impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<()> {
        info!(
            recipient_id = %request.recipient_id,
            message_id = %request.message_id,
            "Notification: {} - {}",
            request.title,
            request.body
        );
        Ok(())
    }
}

/// Forwards requests into a channel, for embedding and tests.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationDispatcher for ChannelDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<()> {
        self.tx.send(request).map_err(|e| {
            warn!("Notification channel closed, dropping {}", e.0.message_id);
            ChatError::Dispatch("notification channel closed".to_string())
        })
    }
}

#[derive(Default)]
struct LedgerInner {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

/// Remembers which messages already produced a request.
#[derive(Default)]
pub struct DispatchLedger {
    inner: Mutex<LedgerInner>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time a message id is seen. Oldest ids are forgotten
    /// once the ledger is full.
    pub fn first_dispatch(&self, message_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.seen.insert(message_id.to_string()) {
            return false;
        }
        inner.order.push_back(message_id.to_string());
        if inner.order.len() > MAX_LEDGER_ENTRIES {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
