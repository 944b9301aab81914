//! Channel membership manager.
//!
//! Joins, leaves and disconnect cleanup. A session is a participant of at most
//! one channel; joining another channel leaves the current one first.

use huddle_protocol::Envelope;
use huddle_transport::TransportError;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::channel::{validate_username, ChannelDirectory, ChannelId};
use crate::error::{HubError, MembershipError};
use crate::fanout::Broadcaster;
use crate::session::{Session, SessionId, SessionRegistry};
use crate::store::{HistoryEntry, MessageStore};

/// What a joiner is sent: current members and recent history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    /// The joined channel.
    pub channel_id: ChannelId,
    /// Member display names in join order, the joiner included.
    pub members: Vec<String>,
    /// Recent messages, oldest first.
    pub history: Vec<HistoryEntry>,
}

/// Applies joins and leaves.
#[derive(Clone)]
pub struct MembershipManager {
    sessions: Arc<SessionRegistry>,
    directory: Arc<ChannelDirectory>,
    broadcaster: Broadcaster,
    store: Arc<dyn MessageStore>,
    history_limit: usize,
}

impl MembershipManager {
    /// Create a manager.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionRegistry>,
        directory: Arc<ChannelDirectory>,
        broadcaster: Broadcaster,
        store: Arc<dyn MessageStore>,
        history_limit: usize,
    ) -> Self {
        Self {
            sessions,
            directory,
            broadcaster,
            store,
            history_limit,
        }
    }

    /// Join `session` to a channel under `username`.
    ///
    /// The joiner receives `user_list` and then the history replay; the rest
    /// of the channel then receives `user_joined`. Re-joining the current
    /// channel re-sends the snapshot without announcing the session again.
    ///
    /// # Errors
    ///
    /// Returns a membership error for invalid names or when the channel limit
    /// is reached, and a transport error if the snapshot cannot be written to
    /// the joiner. In the latter case the joiner is not left in the channel.
    pub async fn join(
        &self,
        session: &Session,
        username: &str,
        channel_id: &str,
    ) -> Result<MembershipSnapshot, HubError> {
        validate_username(username).map_err(MembershipError::InvalidUsername)?;
        let (channel, created) = self.directory.get_or_create(channel_id)?;
        if created {
            if let Err(e) = self.store.ensure_channel(channel_id, channel_id).await {
                warn!(channel = %channel_id, error = %e, "Failed to register channel");
            }
        }

        let session_id = session.id();
        if let Some(current) = self.directory.channel_of(session_id) {
            if current != channel_id {
                self.leave(session_id, &current).await;
            }
        }

        let mut channel = channel.lock().await;
        let is_new = channel.insert(session_id.clone(), username);
        self.directory.bind(session_id, channel_id);
        session.set_display_name(username);

        let history = self.history(channel_id).await;
        let snapshot = MembershipSnapshot {
            channel_id: channel_id.to_string(),
            members: channel.usernames(),
            history,
        };

        if let Err(e) = self.send_snapshot(session_id, &snapshot).await {
            if let Some(gone) = channel.remove(session_id) {
                self.directory.unbind(session_id, channel_id);
                if !is_new {
                    let notice = Envelope::user_left(channel_id, gone.username);
                    let targets = channel.recipients(None);
                    self.broadcaster.deliver(&mut channel, &notice, targets).await;
                }
            }
            return Err(e.into());
        }

        if is_new {
            let notice = Envelope::user_joined(channel_id, username);
            let targets = channel.recipients(Some(session_id));
            self.broadcaster.deliver(&mut channel, &notice, targets).await;
        }

        debug!(
            channel = %channel_id,
            session = %session_id,
            members = channel.len(),
            rejoin = !is_new,
            "Joined channel"
        );
        Ok(snapshot)
    }

    /// Remove a session from a channel and tell the remaining members.
    ///
    /// Returns `false` if the session was not a member.
    pub async fn leave(&self, session_id: &SessionId, channel_id: &str) -> bool {
        let Some(channel) = self.directory.get(channel_id) else {
            return false;
        };
        let mut channel = channel.lock().await;
        let Some(gone) = channel.remove(session_id) else {
            return false;
        };
        self.directory.unbind(session_id, channel_id);

        let notice = Envelope::user_left(channel_id, gone.username);
        let targets = channel.recipients(None);
        self.broadcaster.deliver(&mut channel, &notice, targets).await;

        debug!(
            channel = %channel_id,
            session = %session_id,
            members = channel.len(),
            "Left channel"
        );
        true
    }

    /// Remove a session from every channel it belongs to.
    pub async fn remove_everywhere(&self, session_id: &SessionId) -> Vec<ChannelId> {
        let mut left = Vec::new();
        while let Some(channel_id) = self.directory.channel_of(session_id) {
            if !self.leave(session_id, &channel_id).await {
                // Index pointed at a channel that no longer lists the session
                self.directory.unbind(session_id, &channel_id);
                continue;
            }
            left.push(channel_id);
        }
        left
    }

    async fn history(&self, channel_id: &str) -> Vec<HistoryEntry> {
        match self.store.recent_history(channel_id, self.history_limit).await {
            Ok(mut rows) => {
                rows.reverse();
                rows
            }
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "History query failed");
                Vec::new()
            }
        }
    }

    async fn send_snapshot(
        &self,
        session_id: &SessionId,
        snapshot: &MembershipSnapshot,
    ) -> Result<(), TransportError> {
        let list = Envelope::user_list(&snapshot.channel_id, snapshot.members.clone());
        self.sessions.write(session_id, &list).await?;

        for row in &snapshot.history {
            let replay = Envelope::chat(&snapshot.channel_id, &row.content)
                .with_username(&row.username)
                .with_timestamp(row.timestamp);
            self.sessions.write(session_id, &replay).await?;
        }
        Ok(())
    }
}
