//! HTTP server implementation for Depot.

use std::net::SocketAddr;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tokio::signal;

use super::config::ServerConfig;
use super::error::attach_error_path;
use super::handlers::{self, AppState};
use super::middleware::{MetricsLayer, TracingLayer};
use super::objects;
use super::ws;

/// HTTP server for the store service.
pub struct Server {
    state: AppState,
    config: ServerConfig,
}

impl Server {
    /// Create a new server.
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    /// Builds the full route table.
    pub fn router(state: AppState) -> Router {
        let metrics = state.metrics.clone();
        Router::new()
            // KV buckets
            .route(
                "/api/v1/kv/buckets",
                post(handlers::create_bucket).get(handlers::list_buckets),
            )
            .route(
                "/api/v1/kv/buckets/{bucket}",
                get(handlers::get_bucket)
                    .put(handlers::update_bucket)
                    .delete(handlers::delete_bucket),
            )
            .route("/api/v1/kv/buckets/{bucket}/purge", delete(handlers::purge_bucket))
            // KV entries
            .route("/api/v1/kv/buckets/{bucket}/keys", get(handlers::list_keys))
            .route(
                "/api/v1/kv/buckets/{bucket}/keys/{key}",
                get(handlers::get_key)
                    .put(handlers::put_key)
                    .delete(handlers::delete_key),
            )
            .route(
                "/api/v1/kv/buckets/{bucket}/keys/{key}/revision/{revision}",
                get(handlers::get_revision),
            )
            .route(
                "/api/v1/kv/buckets/{bucket}/keys/{key}/history",
                get(handlers::get_history),
            )
            .route(
                "/api/v1/kv/buckets/{bucket}/keys/{key}/purge",
                delete(handlers::purge_key),
            )
            // KV watch
            .route("/api/v1/kv/watch/{bucket}", get(ws::watch_kv_bucket))
            .route("/api/v1/kv/watch/{bucket}/{key}", get(ws::watch_kv_key))
            // Object buckets
            .route(
                "/api/v1/objects/buckets",
                post(objects::create_bucket).get(objects::list_buckets),
            )
            .route(
                "/api/v1/objects/buckets/{bucket}",
                get(objects::get_bucket)
                    .put(objects::update_bucket)
                    .delete(objects::delete_bucket),
            )
            // Objects
            .route(
                "/api/v1/objects/buckets/{bucket}/objects",
                get(objects::list_objects),
            )
            .route(
                "/api/v1/objects/buckets/{bucket}/objects/{name}",
                put(objects::upload_object)
                    .get(objects::download_object)
                    .delete(objects::delete_object)
                    // Uploads stream; the per-bucket max object size is
                    // enforced by the pipeline itself.
                    .layer(DefaultBodyLimit::disable()),
            )
            .route(
                "/api/v1/objects/buckets/{bucket}/objects/{name}/metadata",
                get(objects::get_metadata),
            )
            .route(
                "/api/v1/objects/buckets/{bucket}/objects/{name}/verify",
                get(objects::verify_object),
            )
            // Object watch
            .route("/api/v1/objects/watch/{bucket}", get(ws::watch_obj_bucket))
            // Operational
            .route("/metrics", get(handlers::metrics))
            .route("/-/healthy", get(handlers::healthy))
            .route("/-/ready", get(handlers::ready))
            .layer(middleware::from_fn(attach_error_path))
            .layer(TracingLayer::new())
            .layer(MetricsLayer::new(metrics))
            .with_state(state)
    }

    /// Run the HTTP server until SIGINT/SIGTERM.
    pub async fn run(self) {
        let app = Self::router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        tracing::info!("Starting Depot HTTP server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("failed to bind listen address");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .expect("server error");

        tracing::info!("Server shut down gracefully");
    }
}

/// Listen for SIGTERM (pod termination) and SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
