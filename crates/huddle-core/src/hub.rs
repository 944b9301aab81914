//! The hub: owns every component and dispatches inbound envelopes.
//!
//! Join, leave and media are handled inline on the calling session's task.
//! Chat messages go through a bounded queue drained by a single worker that
//! persists each message and then fans it out to the whole channel, both
//! under the channel lock so a concurrent join sees each message exactly once.

use chrono::Utc;
use huddle_protocol::{Body, Envelope, ProtocolError};
use huddle_transport::FrameSink;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelDirectory, ChannelId};
use crate::error::{HubError, MembershipError};
use crate::fanout::Broadcaster;
use crate::membership::{MembershipManager, MembershipSnapshot};
use crate::relay::MediaRelay;
use crate::session::{Session, SessionId, SessionRegistry, DEFAULT_WRITE_TIMEOUT};
use crate::store::{HistoryEntry, MessageStore, DEFAULT_HISTORY_LIMIT};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Channel created at startup.
    pub default_channel: String,
    /// Display name of the default channel.
    pub default_channel_name: String,
    /// History rows replayed on join.
    pub history_limit: usize,
    /// Capacity of the chat queue.
    pub chat_queue_capacity: usize,
    /// Time allowed for one outbound write.
    pub write_timeout: Duration,
    /// Maximum number of channels.
    pub max_channels: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_channel: "general".to_string(),
            default_channel_name: "General".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            chat_queue_capacity: 1024,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_channels: 10_000,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Registered sessions.
    pub session_count: usize,
    /// Existing channels, empty ones included.
    pub channel_count: usize,
    /// Sessions that are a member of a channel.
    pub participant_count: usize,
}

struct ChatJob {
    channel_id: ChannelId,
    entry: HistoryEntry,
    envelope: Envelope,
}

/// The relay hub.
pub struct Hub {
    config: HubConfig,
    sessions: Arc<SessionRegistry>,
    directory: Arc<ChannelDirectory>,
    broadcaster: Broadcaster,
    membership: MembershipManager,
    relay: MediaRelay,
    chat_tx: mpsc::Sender<ChatJob>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Build the hub, seed the default channel and start the chat worker.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: HubConfig, store: Arc<dyn MessageStore>) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new(config.write_timeout));
        let directory = Arc::new(ChannelDirectory::new(config.max_channels));
        directory.seed(&config.default_channel, &config.default_channel_name);
        if let Err(e) = store
            .ensure_channel(&config.default_channel, &config.default_channel_name)
            .await
        {
            warn!(channel = %config.default_channel, error = %e, "Failed to register default channel");
        }

        let broadcaster = Broadcaster::new(Arc::clone(&sessions), Arc::clone(&directory));
        let membership = MembershipManager::new(
            Arc::clone(&sessions),
            Arc::clone(&directory),
            broadcaster.clone(),
            Arc::clone(&store),
            config.history_limit,
        );
        let relay = MediaRelay::new(Arc::clone(&directory), broadcaster.clone());

        let (chat_tx, chat_rx) = mpsc::channel(config.chat_queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_chat_worker(
            chat_rx,
            store,
            Arc::clone(&directory),
            broadcaster.clone(),
            shutdown.clone(),
        ));

        info!(
            default_channel = %config.default_channel,
            history_limit = config.history_limit,
            "Hub started"
        );

        Arc::new(Self {
            config,
            sessions,
            directory,
            broadcaster,
            membership,
            relay,
            chat_tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Session registry.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Channel directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<ChannelDirectory> {
        &self.directory
    }

    /// Fan-out engine.
    #[must_use]
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Membership manager.
    #[must_use]
    pub fn membership(&self) -> &MembershipManager {
        &self.membership
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            session_count: self.sessions.len(),
            channel_count: self.directory.len(),
            participant_count: self.directory.participant_count(),
        }
    }

    /// Register a session for an accepted connection.
    pub fn register(
        &self,
        id: SessionId,
        sink: Box<dyn FrameSink>,
        remote_addr: Option<String>,
    ) -> Arc<Session> {
        self.sessions.register(id, sink, remote_addr)
    }

    /// Handle one inbound envelope from `session`.
    ///
    /// # Errors
    ///
    /// Returns the reason the envelope was dropped. Only errors for which
    /// [`HubError::is_fatal`] holds require the session to be torn down.
    pub async fn dispatch(&self, session: &Session, envelope: Envelope) -> Result<(), HubError> {
        let envelope = envelope.with_timestamp(Utc::now());
        trace!(session = %session.id(), kind = envelope.kind(), "Dispatching");

        match &envelope.body {
            Body::Join { channel } => {
                let username = if envelope.username.is_empty() {
                    session.display_name().unwrap_or_default()
                } else {
                    envelope.username.clone()
                };
                self.join(session, &username, channel).await.map(|_| ())
            }
            Body::Leave { channel } => {
                self.membership.leave(session.id(), channel).await;
                Ok(())
            }
            Body::Chat { channel, content } => {
                let channel_id = channel.clone();
                let content = content.clone();
                self.enqueue_chat(session, channel_id, content, envelope).await
            }
            Body::MediaFrame { .. } => {
                self.relay.relay(session.id(), envelope).await.map(|_| ())
            }
            Body::UserJoined { .. } | Body::UserLeft { .. } | Body::UserList { .. } => {
                Err(ProtocolError::Invalid(format!("{} is server-only", envelope.kind())).into())
            }
        }
    }

    /// Join a session to a channel.
    ///
    /// # Errors
    ///
    /// See [`MembershipManager::join`].
    pub async fn join(
        &self,
        session: &Session,
        username: &str,
        channel_id: &str,
    ) -> Result<MembershipSnapshot, HubError> {
        self.membership.join(session, username, channel_id).await
    }

    /// Tear down a session: leave its channel, then drop it from the registry.
    pub async fn disconnect(&self, session_id: &SessionId) -> Vec<ChannelId> {
        let left = self.membership.remove_everywhere(session_id).await;
        self.sessions.unregister(session_id).await;
        debug!(session = %session_id, channels = left.len(), "Session disconnected");
        left
    }

    /// Stop the chat worker and wake every session's receive loop so it
    /// disconnects. Queued messages not yet taken are dropped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for session in self.sessions.all() {
            session.mark_dead();
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Chat worker panicked");
            }
        }
        info!("Hub stopped");
    }

    async fn enqueue_chat(
        &self,
        session: &Session,
        channel_id: ChannelId,
        content: String,
        envelope: Envelope,
    ) -> Result<(), HubError> {
        if self.directory.channel_of(session.id()).as_deref() != Some(channel_id.as_str()) {
            return Err(MembershipError::NotMember(channel_id).into());
        }
        let username = session.display_name().unwrap_or_default();
        let timestamp = envelope.timestamp.unwrap_or_else(Utc::now);

        let job = ChatJob {
            entry: HistoryEntry::new(username.clone(), content, timestamp),
            envelope: envelope.with_username(username),
            channel_id,
        };
        self.chat_tx
            .send(job)
            .await
            .map_err(|_| HubError::QueueClosed)
    }
}

async fn run_chat_worker(
    mut rx: mpsc::Receiver<ChatJob>,
    store: Arc<dyn MessageStore>,
    directory: Arc<ChannelDirectory>,
    broadcaster: Broadcaster,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            () = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Some(channel) = directory.get(&job.channel_id) else {
            continue;
        };
        // Held across persist and delivery: joins snapshot history under it
        let mut channel = channel.lock().await;
        if let Err(e) = store.append(&job.channel_id, &job.entry).await {
            warn!(channel = %job.channel_id, error = %e, "Failed to persist message");
        }
        let targets = channel.recipients(None);
        let report = broadcaster
            .deliver(&mut channel, &job.envelope, targets)
            .await;
        trace!(
            channel = %job.channel_id,
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "Chat message delivered"
        );
    }
    debug!("Chat worker stopped");
}
