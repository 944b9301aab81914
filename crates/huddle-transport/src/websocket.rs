//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum [`WebSocket`]. Text frames carry JSON envelopes,
//! binary frames carry length-prefixed MessagePack envelopes.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, Encoded, Envelope, EnvelopeCodec, ProtocolError, WireFormat};
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError};

/// WebSocket connection configuration.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketConfig {
    /// Encoding for outbound frames.
    pub wire_format: WireFormat,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Json,
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// An accepted WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<String>,
    config: WebSocketConfig,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<String>, config: WebSocketConfig) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr,
            config,
        }
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let (sink, stream) = self.socket.split();
        let sink = WebSocketSink {
            sink,
            codec: EnvelopeCodec::new(self.config.wire_format),
        };
        let source = WebSocketSource {
            id: self.id,
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: self.config.max_message_size,
        };
        (Box::new(sink), Box::new(source))
    }
}

/// Outbound half of a WebSocket connection.
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    codec: EnvelopeCodec,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let message = match self.codec.encode(envelope)? {
            Encoded::Text(text) => Message::Text(text),
            Encoded::Binary(bytes) => Message::Binary(bytes.to_vec()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

/// Inbound half of a WebSocket connection.
pub struct WebSocketSource {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl WebSocketSource {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                connection = %self.id,
                "Message too large: {} bytes (max: {})",
                len,
                self.max_message_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge(len)));
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        // First, drain envelopes already buffered from earlier binary frames
        if let Some(envelope) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(envelope));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(codec::decode_json(&text)?));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    self.read_buffer.extend_from_slice(&data);

                    if let Some(envelope) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(envelope));
                    }
                    // Need more data, continue reading
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pongs are queued by the socket itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
