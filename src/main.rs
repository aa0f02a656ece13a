//! Depot HTTP server binary entry point.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use depot::server::{AppState, CliArgs, Metrics, Server};
use depot::{ChangeListener, KvStore, ObjectStore, Store, Sweeper, WatchRegistry};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI arguments
    let args = CliArgs::parse();
    let config = args.to_config();
    let server_config = args.server_config();

    tracing::info!(backend = ?config.object.backend, "Starting Depot");

    // Connect and migrate
    let store = Store::connect(&config.db).await.expect("Failed to connect to PostgreSQL");
    store.migrate().await.expect("Failed to apply schema");

    let kv = KvStore::new(store.clone(), config.kv.clone());
    let objects = ObjectStore::new(store.clone(), config.object.clone());

    // Watch fan-out: seed the bucket cache, then start the listener
    let watch = Arc::new(WatchRegistry::new());
    let listener = ChangeListener::new(store.clone(), Arc::clone(&watch));
    listener
        .seed_bucket_cache()
        .await
        .expect("Failed to seed watch bucket cache");

    let cancel = CancellationToken::new();
    let listener_handle = tokio::spawn(listener.run(cancel.clone()));
    let sweeper_handle = tokio::spawn(
        Sweeper::new(store.clone(), config.kv.cleanup_interval).run(cancel.clone()),
    );

    // Serve until SIGINT/SIGTERM
    let state = AppState {
        kv,
        objects,
        store,
        watch,
        metrics: Arc::new(Metrics::new()),
    };
    Server::new(state, server_config).run().await;

    // Drain background tasks
    cancel.cancel();
    let _ = listener_handle.await;
    let _ = sweeper_handle.await;
}
