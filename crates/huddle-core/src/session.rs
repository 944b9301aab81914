//! Live sessions and their outbound write path.
//!
//! Every session owns exactly one [`FrameSink`], guarded by an async mutex.
//! All writes to a client, whether chat fan-out, presence or media relay, go
//! through [`SessionRegistry::write`], so frames for one transport are never
//! interleaved.

use dashmap::DashMap;
use huddle_protocol::Envelope;
use huddle_transport::{ConnectionId, FrameSink, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Session identifier. Same value as the underlying connection ID.
pub type SessionId = ConnectionId;

/// Default time allowed for a single outbound write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// One connected client.
pub struct Session {
    id: SessionId,
    sink: Mutex<Box<dyn FrameSink>>,
    display_name: RwLock<Option<String>>,
    alive: AtomicBool,
    shutdown: CancellationToken,
    remote_addr: Option<String>,
}

impl Session {
    fn new(id: SessionId, sink: Box<dyn FrameSink>, remote_addr: Option<String>) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            display_name: RwLock::new(None),
            alive: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            remote_addr,
        }
    }

    /// Session ID.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Remote address reported by the transport.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Display name, set by the first successful join.
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        self.display_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_display_name(&self, name: &str) {
        *self
            .display_name
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
    }

    /// Whether the session is still usable for writes.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been marked dead.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Mark the session dead and wake its receive loop.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn mark_dead(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        self.shutdown.cancel();
        was_alive
    }

    /// Write one envelope under the session's exclusive write lock.
    ///
    /// A failure marks the session dead; the send is not retried.
    async fn send(&self, envelope: &Envelope, write_timeout: Duration) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        // Re-check: a concurrent writer may have failed while we waited
        if !self.is_alive() {
            return Err(TransportError::ConnectionClosed);
        }

        let result = match tokio::time::timeout(write_timeout, sink.send(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        if let Err(e) = &result {
            if self.mark_dead() {
                warn!(session = %self.id, error = %e, "Write failed, session marked dead");
            }
        }
        result
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(session = %self.id, error = %e, "Close failed");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("display_name", &self.display_name())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    write_timeout: Duration,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            write_timeout,
        }
    }

    /// Register a new session for an accepted connection.
    ///
    /// An existing session with the same ID is replaced and marked dead.
    pub fn register(
        &self,
        id: SessionId,
        sink: Box<dyn FrameSink>,
        remote_addr: Option<String>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(id.clone(), sink, remote_addr));
        if let Some(previous) = self.sessions.insert(id.clone(), Arc::clone(&session)) {
            warn!(session = %id, "Replacing session with duplicate ID");
            previous.mark_dead();
        }
        debug!(session = %id, sessions = self.sessions.len(), "Session registered");
        session
    }

    /// Remove a session, mark it dead and close its transport.
    ///
    /// Idempotent: unknown IDs are ignored.
    pub async fn unregister(&self, id: &SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        session.mark_dead();
        session.close().await;
        debug!(session = %id, sessions = self.sessions.len(), "Session unregistered");
        Some(session)
    }

    /// Look up a session.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Every registered session.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Write an envelope to one session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] for unknown or dead
    /// sessions, or the transport's error if the send fails. The caller must
    /// treat the session as gone.
    pub async fn write(&self, id: &SessionId, envelope: &Envelope) -> Result<(), TransportError> {
        let session = self.get(id).ok_or(TransportError::ConnectionClosed)?;
        session.send(envelope, self.write_timeout).await
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TIMEOUT)
    }
}
