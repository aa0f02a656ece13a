//! HTTP and WebSocket surface for the Depot service.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod objects;
pub mod request;
pub mod response;
pub mod ws;

mod http;

pub use config::{CliArgs, ServerConfig};
pub use handlers::AppState;
pub use http::Server;
pub use metrics::Metrics;
