//! Demo client: connects to a node, listens for messages addressed to a
//! freshly generated identity and logs them until Ctrl+C.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chainpost_client::{ClientConfig, ConnectionManager};
use chainpost_shared::constants::APP_NAME;
use chainpost_shared::{IdentityProvider, LocalIdentity};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chainpost_client=debug")),
        )
        .init();

    info!("Starting {} client v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Configuration and identity
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let mut identity = LocalIdentity::generate();
    if let Some(address) = config.node_address.clone() {
        identity = identity.with_node_address(address);
    }
    info!(
        user = %identity.user_id(),
        public_key = %hex::encode(identity.public_key_bytes()),
        "Generated identity"
    );

    // -----------------------------------------------------------------------
    // 3. Connect and listen
    // -----------------------------------------------------------------------
    let manager = ConnectionManager::new(config, Arc::new(identity));
    manager.initialize();
    manager
        .connect_as_user()
        .await
        .context("Could not connect to a node (set CHAINPOST_NODE_ADDRESS)")?;

    let mut inbox = manager.subscribe(&manager.user_id());
    let mut states = manager.watch_connection_state();

    loop {
        tokio::select! {
            message = inbox.recv() => match message {
                Ok(message) => info!(
                    id = %message.id,
                    from = %message.sender_id,
                    bytes = message.encrypted_content.len(),
                    "Message received"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Inbox lagged"),
                Err(RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(%state, "Connection state");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
