use std::sync::Arc;

use rental_chat::{serve, ChatConfig, ChatService, GatewayState, LogDispatcher, MemoryStore, SeedData};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ChatConfig::from_env();

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.seed_path {
        match SeedData::load(path) {
            Ok(seed) => store.load_seed(seed),
            Err(e) => warn!("Failed to load seed {}: {}", path.display(), e),
        }
    }

    let service = Arc::new(ChatService::new(store, Arc::new(LogDispatcher), &config));
    let state = Arc::new(GatewayState::new(service, config.access_token.clone()));

    let listener = match TcpListener::bind(&config.addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.addr, e);
            std::process::exit(1);
        }
    };

    info!("Rental chat server listening on {}", config.addr);
    serve(listener, state).await;
}
