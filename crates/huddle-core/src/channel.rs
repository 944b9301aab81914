//! Channels and the channel directory.
//!
//! A [`Channel`] is a named set of participants plus the media routes derived
//! from it. Each channel lives behind its own async mutex in the
//! [`ChannelDirectory`]; membership changes, route recomputation and fan-out
//! for a channel all happen while that lock is held.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::MembershipError;
use crate::relay::MediaRoute;
use crate::session::SessionId;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Maximum display name length.
pub const MAX_USERNAME_LENGTH: usize = 64;

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    // Check for valid ASCII printable characters
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Validate a display name.
///
/// # Errors
///
/// Returns an error message if the name is empty, too long, or has control characters.
pub fn validate_username(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Username cannot be empty");
    }
    if name.chars().count() > MAX_USERNAME_LENGTH {
        return Err("Username too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Username contains control characters");
    }
    Ok(())
}

/// A session's membership record in one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// The member session.
    pub session_id: SessionId,
    /// Display name used in this channel.
    pub username: String,
    /// The channel.
    pub channel_id: ChannelId,
    /// When the session joined.
    pub joined_at: DateTime<Utc>,
    seq: u64,
}

/// A named group of participants.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    name: String,
    members: HashMap<SessionId, Participant>,
    routes: HashMap<SessionId, MediaRoute>,
    next_seq: u64,
}

impl Channel {
    /// Create an empty channel.
    #[must_use]
    pub fn new(id: impl Into<ChannelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            members: HashMap::new(),
            routes: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Channel identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of participants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the channel has no participants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether a session is a participant.
    #[must_use]
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.members.contains_key(session_id)
    }

    /// A session's participant record.
    #[must_use]
    pub fn participant(&self, session_id: &SessionId) -> Option<&Participant> {
        self.members.get(session_id)
    }

    /// Add a participant, or update the display name of an existing one.
    ///
    /// Returns `true` if the session was not a member before.
    pub fn insert(&mut self, session_id: SessionId, username: &str) -> bool {
        if let Some(existing) = self.members.get_mut(&session_id) {
            existing.username = username.to_string();
            return false;
        }

        let participant = Participant {
            session_id: session_id.clone(),
            username: username.to_string(),
            channel_id: self.id.clone(),
            joined_at: Utc::now(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.members.insert(session_id, participant);
        self.recompute_routes();
        true
    }

    /// Remove a participant.
    pub fn remove(&mut self, session_id: &SessionId) -> Option<Participant> {
        let removed = self.members.remove(session_id)?;
        self.recompute_routes();
        Some(removed)
    }

    /// Remove every listed session that is still a member.
    ///
    /// Sessions already gone are skipped, so each is removed at most once.
    pub fn evict(&mut self, session_ids: &[SessionId]) -> Vec<Participant> {
        let evicted: Vec<Participant> = session_ids
            .iter()
            .filter_map(|id| self.members.remove(id))
            .collect();
        if !evicted.is_empty() {
            self.recompute_routes();
        }
        evicted
    }

    /// Participants in join order.
    #[must_use]
    pub fn members(&self) -> Vec<&Participant> {
        let mut members: Vec<&Participant> = self.members.values().collect();
        members.sort_by_key(|p| p.seq);
        members
    }

    /// Display names in join order.
    #[must_use]
    pub fn usernames(&self) -> Vec<String> {
        self.members()
            .into_iter()
            .map(|p| p.username.clone())
            .collect()
    }

    /// Member session IDs in join order, optionally without one session.
    #[must_use]
    pub fn recipients(&self, exclude: Option<&SessionId>) -> Vec<SessionId> {
        self.members()
            .into_iter()
            .filter(|p| Some(&p.session_id) != exclude)
            .map(|p| p.session_id.clone())
            .collect()
    }

    /// The media route of a member.
    #[must_use]
    pub fn route(&self, session_id: &SessionId) -> Option<&MediaRoute> {
        self.routes.get(session_id)
    }

    fn recompute_routes(&mut self) {
        let order = self.recipients(None);
        self.routes = order
            .iter()
            .map(|source| (source.clone(), MediaRoute::fan_out(source, &order)))
            .collect();
    }
}

/// All channels, plus the index of which channel each session is in.
pub struct ChannelDirectory {
    channels: DashMap<ChannelId, Arc<Mutex<Channel>>>,
    memberships: DashMap<SessionId, ChannelId>,
    max_channels: usize,
}

impl ChannelDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new(max_channels: usize) -> Self {
        Self {
            channels: DashMap::new(),
            memberships: DashMap::new(),
            max_channels,
        }
    }

    /// Create a channel up front, ignoring the channel limit.
    pub fn seed(&self, id: &str, name: &str) -> Arc<Mutex<Channel>> {
        let entry = self
            .channels
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Channel::new(id, name))));
        Arc::clone(entry.value())
    }

    /// Look up a channel.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Channel>>> {
        self.channels.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a channel, creating it if absent.
    ///
    /// Returns the channel and whether this call created it.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the channel limit is reached.
    pub fn get_or_create(
        &self,
        id: &str,
    ) -> Result<(Arc<Mutex<Channel>>, bool), MembershipError> {
        validate_channel_name(id).map_err(MembershipError::InvalidChannel)?;

        if let Some(channel) = self.get(id) {
            return Ok((channel, false));
        }
        if self.channels.len() >= self.max_channels {
            return Err(MembershipError::MaxChannelsReached);
        }

        let mut created = false;
        let entry = self.channels.entry(id.to_string()).or_insert_with(|| {
            created = true;
            debug!(channel = %id, "Creating new channel");
            Arc::new(Mutex::new(Channel::new(id, id)))
        });
        Ok((Arc::clone(entry.value()), created))
    }

    /// The channel a session is currently a member of.
    #[must_use]
    pub fn channel_of(&self, session_id: &SessionId) -> Option<ChannelId> {
        self.memberships
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    /// Record membership. Call with the channel lock held.
    pub(crate) fn bind(&self, session_id: &SessionId, channel_id: &str) {
        self.memberships
            .insert(session_id.clone(), channel_id.to_string());
    }

    /// Forget membership if it still points at `channel_id`. Call with the
    /// channel lock held.
    pub(crate) fn unbind(&self, session_id: &SessionId, channel_id: &str) {
        self.memberships
            .remove_if(session_id, |_, current| current == channel_id);
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether there are no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Number of sessions that are a member of some channel.
    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.memberships.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(id: &str) -> SessionId {
        SessionId::new(id)
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("general").is_ok());
        assert!(validate_channel_name("team:audio").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("$system").is_err());
        assert!(validate_channel_name("bad\nname").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[test]
    fn test_username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("  ").is_err());
        assert!(validate_username("a\u{7}").is_err());
        assert!(validate_username(&"x".repeat(MAX_USERNAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_insert_remove_keeps_join_order() {
        let mut channel = Channel::new("general", "General");
        assert!(channel.insert(sid("c1"), "alice"));
        assert!(channel.insert(sid("c2"), "bob"));
        assert!(channel.insert(sid("c3"), "carol"));
        assert_eq!(channel.usernames(), ["alice", "bob", "carol"]);

        // Re-insert updates the name without changing position
        assert!(!channel.insert(sid("c1"), "alicia"));
        assert_eq!(channel.usernames(), ["alicia", "bob", "carol"]);

        assert_eq!(channel.remove(&sid("c2")).unwrap().username, "bob");
        assert!(channel.remove(&sid("c2")).is_none());
        assert_eq!(channel.recipients(Some(&sid("c1"))), [sid("c3")]);
    }

    #[test]
    fn test_evict_removes_each_once() {
        let mut channel = Channel::new("general", "General");
        channel.insert(sid("c1"), "alice");
        channel.insert(sid("c2"), "bob");

        let evicted = channel.evict(&[sid("c2"), sid("c2"), sid("c9")]);
        assert_eq!(evicted.len(), 1);
        assert!(channel.evict(&[sid("c2")]).is_empty());
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_routes_follow_membership() {
        let mut channel = Channel::new("general", "General");
        channel.insert(sid("c1"), "alice");
        assert!(channel.route(&sid("c1")).unwrap().targets().is_empty());

        channel.insert(sid("c2"), "bob");
        channel.insert(sid("c3"), "carol");
        assert_eq!(channel.route(&sid("c1")).unwrap().targets(), [sid("c2"), sid("c3")]);
        assert_eq!(channel.route(&sid("c3")).unwrap().targets(), [sid("c1"), sid("c2")]);

        channel.remove(&sid("c2"));
        assert!(channel.route(&sid("c2")).is_none());
        assert_eq!(channel.route(&sid("c1")).unwrap().targets(), [sid("c3")]);
    }

    #[tokio::test]
    async fn test_directory_get_or_create() {
        let directory = ChannelDirectory::new(2);
        directory.seed("general", "General");

        let (_, created) = directory.get_or_create("general").unwrap();
        assert!(!created);
        let (channel, created) = directory.get_or_create("random").unwrap();
        assert!(created);
        assert_eq!(channel.lock().await.name(), "random");

        assert!(matches!(
            directory.get_or_create("third"),
            Err(MembershipError::MaxChannelsReached)
        ));
        assert!(matches!(
            directory.get_or_create(""),
            Err(MembershipError::InvalidChannel(_))
        ));
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_unbind_only_matching_channel() {
        let directory = ChannelDirectory::new(10);
        directory.bind(&sid("c1"), "general");

        directory.unbind(&sid("c1"), "random");
        assert_eq!(directory.channel_of(&sid("c1")).as_deref(), Some("general"));

        directory.unbind(&sid("c1"), "general");
        assert!(directory.channel_of(&sid("c1")).is_none());
    }
}
