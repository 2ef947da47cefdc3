//! WebSocket transport over [`ChatService`]: JSON frames in, JSON frames out.

mod connection;
mod frames;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{error, info};

use crate::dispatch::NotificationDispatcher;
use crate::service::ChatService;
use crate::store::EntityStore;

pub use connection::{enforce_identity, handle_connection};
pub use frames::{
    ClientFrame, ConversationInput, SendMessageInput, ServerFrame, StartConversationInput,
};

/// Shared by every connection
pub struct GatewayState<S, D> {
    pub service: Arc<ChatService<S, D>>,
    /// Clients must present this token on connect, when set
    pub access_token: Option<String>,
}

impl<S, D> GatewayState<S, D> {
    pub fn new(service: Arc<ChatService<S, D>>, access_token: Option<String>) -> Self {
        Self {
            service,
            access_token,
        }
    }
}

/// Accept connections forever. Accept errors are logged and the loop keeps going.
pub async fn serve<S: EntityStore, D: NotificationDispatcher>(
    listener: TcpListener,
    state: Arc<GatewayState<S, D>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New connection from {}", peer_addr);

                let state = state.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws_stream) => {
                            handle_connection(ws_stream, state).await;
                        }
                        Err(e) => {
                            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
                        }
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
