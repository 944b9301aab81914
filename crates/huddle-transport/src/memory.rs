//! In-process transport.
//!
//! A [`MemoryConnection`] is the hub side of a connection whose client side is
//! a [`MemoryPeer`] in the same process. Used to drive sessions in tests and
//! benchmarks without sockets.

use async_trait::async_trait;
use huddle_protocol::{Envelope, ProtocolError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, FrameSink, FrameSource, TransportError};

type Inbound = Result<Envelope, ProtocolError>;

/// Hub side of an in-process connection.
pub struct MemoryConnection {
    id: ConnectionId,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<Envelope>,
    fail_writes: Arc<AtomicBool>,
}

/// Client side of an in-process connection.
pub struct MemoryPeer {
    id: ConnectionId,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// Create a connected pair.
    #[must_use]
    pub fn pair(id: impl Into<ConnectionId>) -> (MemoryConnection, MemoryPeer) {
        let id = id.into();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let fail_writes = Arc::new(AtomicBool::new(false));

        let connection = MemoryConnection {
            id: id.clone(),
            inbound: in_rx,
            outbound: out_tx,
            fail_writes: Arc::clone(&fail_writes),
        };
        let peer = MemoryPeer {
            id,
            inbound: Some(in_tx),
            outbound: out_rx,
            fail_writes,
        };
        (connection, peer)
    }

    /// Split into sink and source without boxing.
    #[must_use]
    pub fn into_parts(self) -> (MemorySink, MemorySource) {
        (
            MemorySink {
                outbound: self.outbound,
                fail_writes: self.fail_writes,
            },
            MemorySource {
                inbound: self.inbound,
            },
        )
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let (sink, source) = self.into_parts();
        (Box::new(sink), Box::new(source))
    }
}

/// Outbound half of a [`MemoryConnection`].
pub struct MemorySink {
    outbound: mpsc::UnboundedSender<Envelope>,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("injected write failure".into()));
        }
        self.outbound
            .send(envelope.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Inbound half of a [`MemoryConnection`].
pub struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(envelope)) => Ok(Some(envelope)),
            Some(Err(e)) => Err(TransportError::Protocol(e)),
            None => Ok(None),
        }
    }
}

impl MemoryPeer {
    /// The connection ID shared with the hub side.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Send an envelope to the hub. Returns `false` once the peer is closed.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(envelope)).is_ok())
    }

    /// Deliver a frame that failed to decode.
    pub fn send_malformed(&self, reason: impl Into<String>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Err(ProtocolError::Invalid(reason.into()))).is_ok())
    }

    /// Receive the next envelope the hub sent.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.outbound.recv().await
    }

    /// Take an already delivered envelope without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.outbound.try_recv().ok()
    }

    /// Take every envelope delivered so far.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut received = Vec::new();
        while let Ok(envelope) = self.outbound.try_recv() {
            received.push(envelope);
        }
        received
    }

    /// Make every further write from the hub fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Close the client side; the hub's source then reports a clean close.
    pub fn close(&mut self) {
        self.inbound = None;
    }
}
