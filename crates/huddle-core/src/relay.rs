//! Media relay router.
//!
//! Audio frames are relayed as opaque payloads. Each participant has a
//! [`MediaRoute`] listing everyone else in its channel; the channel recomputes
//! routes whenever its membership changes, so a frame always follows the
//! membership at the moment it is relayed.

use huddle_protocol::{Body, Envelope, ProtocolError};
use std::sync::Arc;
use tracing::trace;

use crate::channel::ChannelDirectory;
use crate::error::{HubError, MembershipError};
use crate::fanout::{Broadcaster, FanoutReport};
use crate::session::SessionId;

/// Fan-out targets for one participant's media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRoute {
    source: SessionId,
    targets: Vec<SessionId>,
}

impl MediaRoute {
    /// Route from `source` to every other session in `members`.
    #[must_use]
    pub fn fan_out(source: &SessionId, members: &[SessionId]) -> Self {
        Self {
            source: source.clone(),
            targets: members.iter().filter(|m| *m != source).cloned().collect(),
        }
    }

    /// The sending participant.
    #[must_use]
    pub fn source(&self) -> &SessionId {
        &self.source
    }

    /// Sessions receiving the source's frames.
    #[must_use]
    pub fn targets(&self) -> &[SessionId] {
        &self.targets
    }
}

/// Forwards media frames along participant routes.
#[derive(Clone)]
pub struct MediaRelay {
    directory: Arc<ChannelDirectory>,
    broadcaster: Broadcaster,
}

impl MediaRelay {
    /// Create a relay.
    #[must_use]
    pub fn new(directory: Arc<ChannelDirectory>, broadcaster: Broadcaster) -> Self {
        Self {
            directory,
            broadcaster,
        }
    }

    /// Relay a `media_frame` from `sender` to the rest of its channel.
    ///
    /// The sender's display name in the channel replaces whatever name the
    /// frame carried.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for non-media envelopes or empty payloads, and
    /// [`MembershipError::NotMember`] if the sender is not in the channel.
    pub async fn relay(
        &self,
        sender: &SessionId,
        mut envelope: Envelope,
    ) -> Result<FanoutReport, HubError> {
        let Body::MediaFrame { audio_data, .. } = &envelope.body else {
            return Err(ProtocolError::Invalid(format!(
                "expected media_frame, got {}",
                envelope.kind()
            ))
            .into());
        };
        if audio_data.is_empty() {
            return Err(ProtocolError::Invalid("empty media payload".into()).into());
        }

        let channel_id = envelope.channel().to_string();
        let not_member = || MembershipError::NotMember(channel_id.clone());
        let channel = self.directory.get(&channel_id).ok_or_else(not_member)?;
        let mut channel = channel.lock().await;

        let participant = channel.participant(sender).ok_or_else(not_member)?;
        envelope.username = participant.username.clone();
        let targets = channel
            .route(sender)
            .map(|route| route.targets().to_vec())
            .unwrap_or_default();

        trace!(
            channel = %channel_id,
            session = %sender,
            targets = targets.len(),
            "Relaying media frame"
        );
        Ok(self.broadcaster.deliver(&mut channel, &envelope, targets).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use huddle_transport::{MemoryConnection, MemoryPeer};

    fn setup(count: usize) -> (MediaRelay, Vec<MemoryPeer>) {
        let sessions = Arc::new(SessionRegistry::default());
        let directory = Arc::new(ChannelDirectory::new(16));
        let channel = directory.seed("general", "General");
        directory.seed("random", "Random");
        let mut peers = Vec::new();

        let mut guard = channel.try_lock().unwrap();
        for i in 0..count {
            let (conn, peer) = MemoryConnection::pair(format!("c{i}"));
            let (sink, _source) = conn.into_parts();
            sessions.register(peer.id().clone(), Box::new(sink), None);
            guard.insert(peer.id().clone(), &format!("user{i}"));
            peers.push(peer);
        }
        drop(guard);

        let broadcaster = Broadcaster::new(sessions, Arc::clone(&directory));
        (MediaRelay::new(directory, broadcaster), peers)
    }

    #[test]
    fn test_route_excludes_source() {
        let members: Vec<SessionId> = ["a", "b", "c"].into_iter().map(SessionId::from).collect();
        let route = MediaRoute::fan_out(&members[1], &members);
        assert_eq!(route.source(), &members[1]);
        assert_eq!(route.targets(), [members[0].clone(), members[2].clone()]);
    }

    #[tokio::test]
    async fn test_media_never_echoed() {
        for size in 1..=4 {
            let (relay, mut peers) = setup(size);
            let sender = peers[0].id().clone();
            let frame = Envelope::media_frame("general", "AAAA", Some(48_000)).with_username("spoofed");

            let report = relay.relay(&sender, frame).await.unwrap();
            assert_eq!(report.delivered, size - 1);
            assert!(peers[0].drain().is_empty());

            for peer in &mut peers[1..] {
                let received = peer.drain();
                assert_eq!(received.len(), 1);
                assert_eq!(received[0].username, "user0");
                assert_eq!(received[0].kind(), "media_frame");
            }
        }
    }

    #[tokio::test]
    async fn test_media_requires_membership() {
        let (relay, mut peers) = setup(2);
        let sender = peers[0].id().clone();

        let result = relay
            .relay(&sender, Envelope::media_frame("random", "AAAA", None))
            .await;
        assert!(matches!(result, Err(HubError::Membership(MembershipError::NotMember(_)))));

        let outsider = SessionId::new("outsider");
        let result = relay
            .relay(&outsider, Envelope::media_frame("general", "AAAA", None))
            .await;
        assert!(matches!(result, Err(HubError::Membership(_))));
        assert!(peers[1].drain().is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_dropped() {
        let (relay, mut peers) = setup(2);
        let sender = peers[0].id().clone();

        let result = relay
            .relay(&sender, Envelope::media_frame("general", "", None))
            .await;
        assert!(matches!(result, Err(HubError::Protocol(_))));
        assert!(peers[1].drain().is_empty());
    }
}
