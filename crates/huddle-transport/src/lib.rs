//! # huddle-transport
//!
//! Transport abstraction layer for the Huddle relay hub.
//!
//! - **WebSocket** - axum upgraded sockets, JSON text or MessagePack binary
//! - **Memory** - in-process pairs for tests and embedding
//!
//! ## Transport Abstraction
//!
//! Every connection splits into a [`FrameSink`] and a [`FrameSource`], so the
//! hub can own the write side behind a lock while a dedicated task reads.
//!
//! ```rust,ignore
//! use huddle_transport::{Connection, FrameSource};
//!
//! async fn handle_connection(conn: Box<dyn Connection>) {
//!     let (sink, mut source) = conn.split();
//!     while let Ok(Some(envelope)) = source.recv().await {
//!         // Dispatch envelope
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer};
pub use traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection};
