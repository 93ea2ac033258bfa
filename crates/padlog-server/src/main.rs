//! # padlog-server
//!
//! Storage node for collaborative documents.
//!
//! This binary provides:
//! - **Append-only channel logs** with per-channel FIFO writes, acknowledged
//!   only once durable
//! - **Index cache** of checkpoints and recent message hashes, rebuilt lazily
//!   and resumed from a persisted offset
//! - **History resolution** from client cursors, with EUNKNOWN when a cursor
//!   falls outside retained history
//! - **Acceptance pipeline** (metadata, signature validation, dedup, persist,
//!   broadcast) in strict per-channel order
//! - **REST API** (axum) for the node's collaborators
//! - **Shard ownership**: only channels routed to this node are served

mod api;
mod config;
mod error;
mod hub;
mod pipeline;
mod validator;

use std::sync::Arc;

use padlog_store::ChannelStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::NodeConfig;
use crate::hub::ChannelHub;
use crate::pipeline::Pipeline;
use crate::validator::Ed25519Validator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,padlog_server=debug,padlog_store=debug")
            }),
        )
        .init();

    info!("Starting padlog storage node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    if config.shard_index >= config.shard_count {
        anyhow::bail!(
            "SHARD_INDEX {} is out of range for SHARD_COUNT {}",
            config.shard_index,
            config.shard_count
        );
    }
    let router = config.router();
    let local = config.local_shard();
    info!(shard = %local, shards = config.shard_count, "Serving shard");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = ChannelStore::open(config.store_config()).await?;
    let hub = ChannelHub::new();
    let pipeline = Pipeline::new(
        store.clone(),
        Arc::new(Ed25519Validator),
        hub.clone(),
        router.clone(),
        local,
    );

    let app_state = AppState {
        pipeline,
        router,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic eviction of idle channel state and dead subscriptions
    let idle = config.index_idle;
    let every = config.eviction_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let evicted = store.evict_idle(idle);
            let purged = hub.purge_idle().await;
            if evicted > 0 || purged > 0 {
                info!(evicted, purged, "Evicted idle channel state");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
