use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message as WsFrame, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::frames::{validated, ClientFrame, ServerFrame};
use super::GatewayState;
use crate::dispatch::NotificationDispatcher;
use crate::error::{ChatError, Result};
use crate::store::EntityStore;

/// Handle a single WebSocket connection
pub async fn handle_connection<S: EntityStore, D: NotificationDispatcher>(
    ws_stream: WebSocketStream<TcpStream>,
    state: Arc<GatewayState<S, D>>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let user_id = match wait_for_connect(&mut ws_receiver, state.access_token.as_deref()).await {
        Some(id) => id,
        None => {
            warn!("Connection closed before authentication");
            let _ = ws_sender.close().await;
            return;
        }
    };

    info!("User connected: {}", user_id);

    let auth_response = ServerFrame::AuthResponse {
        success: true,
        message: "Connected to server".to_string(),
    };
    match auth_response.to_json() {
        Ok(json) => {
            if let Err(e) = ws_sender.send(WsFrame::Text(json)).await {
                error!("Failed to send auth response to {}: {}", user_id, e);
                return;
            }
        }
        Err(e) => {
            error!("Failed to serialize auth response for {}: {}", user_id, e);
            return;
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(WsFrame::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(user_id.clone(), state.clone(), tx);

    loop {
        tokio::select! {
            res = ws_receiver.next() => {
                match res {
                    Some(Ok(WsFrame::Text(text))) => {
                        session.handle_text(&text).await;
                    }
                    Some(Ok(WsFrame::Close(_))) => {
                        info!("User {} sent close frame", user_id);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error for user {}: {}", user_id, e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended for user {}", user_id);
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut send_task => {
                info!("Send task finished for user {} (likely connection lost)", user_id);
                break;
            }
        }
    }

    drop(session);
    send_task.abort();
    info!("User disconnected: {}", user_id);
}

/// Wait for the Connect frame from a new connection
async fn wait_for_connect(
    receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    expected_token: Option<&str>,
) -> Option<String> {
    // Give client 10 seconds to authenticate
    let timeout = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(result) = receiver.next().await {
            if let Ok(WsFrame::Text(text)) = result {
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Connect { user_id, token }) => {
                        let user_id = user_id.trim().to_string();
                        if user_id.is_empty() {
                            warn!("Authentication failed: empty user id");
                            return None;
                        }
                        if let Some(expected) = expected_token {
                            if token.as_deref() != Some(expected) {
                                warn!("Authentication failed for {}: invalid or missing token", user_id);
                                return None;
                            }
                        }
                        return Some(user_id);
                    }
                    Ok(other) => {
                        debug!("Ignoring {:?} before connect", other);
                    }
                    Err(e) => {
                        warn!("Failed to parse Connect frame: {}", e);
                    }
                }
            }
        }
        None
    });

    match timeout.await {
        Ok(result) => result,
        Err(_) => {
            warn!("Authentication timeout");
            None
        }
    }
}

/// Overwrite any client-supplied sender with the authenticated identity.
pub fn enforce_identity(frame: &mut ClientFrame, user_id: &str) {
    match frame {
        ClientFrame::SendMessage(input) => input.sender_id = user_id.to_string(),
        ClientFrame::StartConversation(input) => input.sender_id = user_id.to_string(),
        ClientFrame::Connect { .. }
        | ClientFrame::ListConversations
        | ClientFrame::OpenConversation(_)
        | ClientFrame::CloseConversation(_) => {}
    }
}

/// Per-connection state: the live views this client has open.
struct Session<S, D> {
    user_id: String,
    state: Arc<GatewayState<S, D>>,
    outbound: mpsc::UnboundedSender<String>,
    feed: Option<JoinHandle<()>>,
    /// conversation_id -> task forwarding that conversation's messages
    views: HashMap<String, JoinHandle<()>>,
}

impl<S: EntityStore, D: NotificationDispatcher> Session<S, D> {
    fn new(
        user_id: String,
        state: Arc<GatewayState<S, D>>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            user_id,
            state,
            outbound,
            feed: None,
            views: HashMap::new(),
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let mut frame: ClientFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to parse frame from {}: {}", self.user_id, e);
                self.send(&ServerFrame::error(&ChatError::from(e)));
                return;
            }
        };
        enforce_identity(&mut frame, &self.user_id);

        if let Err(e) = self.handle_frame(frame).await {
            debug!("Request from {} failed: {}", self.user_id, e);
            self.send(&ServerFrame::error(&e));
        }
    }

    async fn handle_frame(&mut self, frame: ClientFrame) -> Result<()> {
        let service = &self.state.service;
        match frame {
            ClientFrame::Connect { .. } => {
                // Already authenticated, ignore
            }
            ClientFrame::ListConversations => {
                let mut feed = service.list_conversations(&self.user_id)?;
                let outbound = self.outbound.clone();
                let task = tokio::spawn(async move {
                    let mut state = feed.latest();
                    loop {
                        if forward(&outbound, ServerFrame::Conversations {
                            status: state.status,
                            items: state.items,
                        })
                        .is_err()
                        {
                            return;
                        }
                        state = match feed.changed().await {
                            Some(next) => next,
                            None => return,
                        };
                    }
                });
                if let Some(previous) = self.feed.replace(task) {
                    previous.abort();
                }
            }
            ClientFrame::OpenConversation(input) => {
                let input = validated(input)?;
                let mut view = service
                    .open_conversation(&input.conversation_id, &self.user_id)
                    .await?;
                self.send(&ServerFrame::Opened {
                    conversation_id: input.conversation_id.clone(),
                });
                let outbound = self.outbound.clone();
                let task = tokio::spawn(async move {
                    while let Some(message) = view.recv().await {
                        if forward(&outbound, ServerFrame::Message { message }).is_err() {
                            return;
                        }
                    }
                });
                if let Some(previous) = self.views.insert(input.conversation_id, task) {
                    previous.abort();
                }
            }
            ClientFrame::CloseConversation(input) => {
                let input = validated(input)?;
                if let Some(task) = self.views.remove(&input.conversation_id) {
                    task.abort();
                }
                self.send(&ServerFrame::Closed {
                    conversation_id: input.conversation_id,
                });
            }
            ClientFrame::SendMessage(input) => {
                let input = validated(input)?;
                let message = service
                    .send_message(&input.conversation_id, &input.sender_id, &input.text)
                    .await?;
                self.send(&ServerFrame::SendResult {
                    conversation_id: input.conversation_id,
                    message,
                });
            }
            ClientFrame::StartConversation(input) => {
                let input = validated(input)?;
                let (conversation, message) = service
                    .start_conversation(
                        &input.product_id,
                        &input.seller_id,
                        &input.renter_id,
                        &input.sender_id,
                        &input.text,
                    )
                    .await?;
                self.send(&ServerFrame::SendResult {
                    conversation_id: conversation.conversation_id,
                    message,
                });
            }
        }
        Ok(())
    }

    fn send(&self, frame: &ServerFrame) {
        match frame.to_json() {
            Ok(json) => {
                let _ = self.outbound.send(json);
            }
            Err(e) => error!("Failed to serialize frame for {}: {}", self.user_id, e),
        }
    }
}

impl<S, D> Drop for Session<S, D> {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
        for (_, task) in self.views.drain() {
            task.abort();
        }
    }
}

fn forward(outbound: &mpsc::UnboundedSender<String>, frame: ServerFrame) -> Result<()> {
    let json = frame.to_json()?;
    outbound
        .send(json)
        .map_err(|_| ChatError::Dispatch("connection closed".to_string()))
}
