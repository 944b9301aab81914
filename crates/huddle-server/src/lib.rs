//! # huddle-server
//!
//! HTTP and WebSocket front end for the Huddle relay hub: configuration,
//! storage selection, the session receive loop and Prometheus metrics.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod storage;

pub use config::Config;
pub use handlers::{router, run_server, serve_connection, AppState};
pub use storage::{open_store, SqliteStore};
