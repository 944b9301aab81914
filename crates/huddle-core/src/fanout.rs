//! Broadcast fan-out engine.
//!
//! Writes one envelope to many sessions concurrently. A recipient whose write
//! fails is evicted from the channel and the remaining members are told it
//! left; those notices go through the same path, so failures cascade until
//! a round completes cleanly.

use futures_util::future::join_all;
use huddle_protocol::Envelope;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::channel::{Channel, ChannelDirectory};
use crate::session::{SessionId, SessionRegistry};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Recipients of the original envelope that received it.
    pub delivered: usize,
    /// Sessions evicted from the channel, including cascaded evictions.
    pub evicted: Vec<SessionId>,
}

/// Delivers envelopes to channel members.
#[derive(Clone)]
pub struct Broadcaster {
    sessions: Arc<SessionRegistry>,
    directory: Arc<ChannelDirectory>,
}

impl Broadcaster {
    /// Create a broadcaster over a registry and directory.
    #[must_use]
    pub fn new(sessions: Arc<SessionRegistry>, directory: Arc<ChannelDirectory>) -> Self {
        Self {
            sessions,
            directory,
        }
    }

    /// Send an envelope to every member of a channel except `exclude`.
    ///
    /// Unknown channels yield an empty report.
    pub async fn broadcast_to_channel(
        &self,
        channel_id: &str,
        envelope: &Envelope,
        exclude: Option<&SessionId>,
    ) -> FanoutReport {
        let Some(channel) = self.directory.get(channel_id) else {
            return FanoutReport::default();
        };
        let mut channel = channel.lock().await;
        let targets = channel.recipients(exclude);
        self.deliver(&mut channel, envelope, targets).await
    }

    /// Send an envelope to `targets` of an already locked channel.
    ///
    /// Failed recipients are evicted and announced with `user_left`.
    pub async fn deliver(
        &self,
        channel: &mut Channel,
        envelope: &Envelope,
        targets: Vec<SessionId>,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        let mut pending = VecDeque::from([(envelope.clone(), targets)]);
        let mut first = true;

        while let Some((envelope, targets)) = pending.pop_front() {
            let failed = self.write_all(&envelope, &targets).await;
            if first {
                report.delivered = targets.len() - failed.len();
                first = false;
            }
            trace!(
                channel = %channel.id(),
                kind = envelope.kind(),
                recipients = targets.len(),
                failed = failed.len(),
                "Fan-out round"
            );

            for gone in channel.evict(&failed) {
                self.directory.unbind(&gone.session_id, channel.id());
                warn!(
                    channel = %channel.id(),
                    session = %gone.session_id,
                    "Evicted unreachable participant"
                );
                let notice = Envelope::user_left(channel.id(), gone.username);
                pending.push_back((notice, channel.recipients(None)));
                report.evicted.push(gone.session_id);
            }
        }

        report
    }

    async fn write_all(&self, envelope: &Envelope, targets: &[SessionId]) -> Vec<SessionId> {
        let writes = targets.iter().map(|id| async move {
            match self.sessions.write(id, envelope).await {
                Ok(()) => None,
                Err(_) => Some(id.clone()),
            }
        });
        join_all(writes).await.into_iter().flatten().collect()
    }
}
