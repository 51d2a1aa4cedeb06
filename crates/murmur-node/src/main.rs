//! # murmur-node
//!
//! Storage node for one Murmur community.
//!
//! This binary:
//! - opens the community's persistent replica under the data directory
//! - runs the storage facade behind a protocol bridge task
//! - exposes the bridge as a WebSocket **data socket** (`/ws`) carrying
//!   JSON command and event frames, plus `/health`

mod api;
mod config;

use std::sync::Arc;
use std::time::Duration;

use murmur_shared::protocol::BridgeCommand;
use murmur_shared::Ed25519Crypto;
use murmur_store::{spawn_bridge, LocalSubstrate, StorageFacade};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::NodeConfig;

/// How long the bridge gets to close storage on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,murmur_store=debug,murmur_node=debug")
            }),
        )
        .init();

    info!("Starting Murmur node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");
    let options = config.storage_options()?;

    // -----------------------------------------------------------------------
    // 3. Open the replica and start the bridge
    // -----------------------------------------------------------------------
    let substrate = Arc::new(LocalSubstrate::open(&config.community_dir())?);
    info!(replica = substrate.replica_id(), "Replica opened");

    let (storage_tx, storage_rx) = mpsc::unbounded_channel();
    let facade = StorageFacade::new(
        config.community_id.clone(),
        substrate,
        Arc::new(Ed25519Crypto::new()),
        options,
        storage_tx,
    );
    let (cmd_tx, bridge_events, bridge) = spawn_bridge(facade, storage_rx);

    let (socket_tx, _) = broadcast::channel::<String>(256);
    let fanout = api::spawn_event_fanout(bridge_events, socket_tx.clone());

    let app_state = AppState {
        community_id: Arc::from(config.community_id.as_str()),
        commands: cmd_tx.clone(),
        events: socket_tx,
    };

    // -----------------------------------------------------------------------
    // 4. Serve the data socket until shutdown
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Data socket server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Open sockets may still hold command senders, so the bridge is not
    // guaranteed to see its channel close.
    let _ = cmd_tx.send(BridgeCommand::Close).await;
    drop(cmd_tx);
    if tokio::time::timeout(SHUTDOWN_GRACE, bridge).await.is_err() {
        warn!("Storage bridge did not stop in time");
    }
    fanout.abort();

    info!("Storage closed");
    Ok(())
}
