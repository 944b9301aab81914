//! Envelope types for the Huddle wire protocol.
//!
//! An envelope is the unit exchanged between clients and the hub. The JSON
//! shape is flat: a `type` tag, the sender `username`, a server-assigned
//! `timestamp` and the kind-specific fields (`channel`, `content`, `data`,
//! `audioData`, `sampleRate`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// The kind-specific part of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Body {
    /// Client request to join a channel.
    #[serde(rename = "join_channel")]
    Join {
        /// Channel to join.
        channel: String,
    },

    /// Client request to leave a channel.
    #[serde(rename = "leave_channel")]
    Leave {
        /// Channel to leave.
        channel: String,
    },

    /// A text message. Also used for history replay.
    #[serde(rename = "message")]
    Chat {
        /// Target channel.
        channel: String,
        /// Message text.
        #[serde(default)]
        content: String,
    },

    /// A short opaque audio payload relayed to the rest of the channel.
    #[serde(rename = "media_frame", alias = "audio_chunk", alias = "audio_data")]
    MediaFrame {
        /// Target channel.
        channel: String,
        /// Opaque payload, usually base64 encoded by the client.
        #[serde(rename = "audioData", default)]
        audio_data: String,
        /// Encoding hint.
        #[serde(rename = "sampleRate", default, skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
    },

    /// Presence: a user joined the channel.
    #[serde(rename = "user_joined")]
    UserJoined {
        /// Channel the user joined.
        channel: String,
    },

    /// Presence: a user left the channel.
    #[serde(rename = "user_left")]
    UserLeft {
        /// Channel the user left.
        channel: String,
    },

    /// Current member list, sent to a joiner before history replay.
    #[serde(rename = "user_list")]
    UserList {
        /// Channel the list belongs to.
        channel: String,
        /// Usernames of the current members.
        #[serde(default)]
        data: Vec<String>,
    },
}

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender (or subject, for presence) display name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// Wall-clock time assigned by the hub at ingress.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,

    /// Kind-specific fields.
    #[serde(flatten)]
    pub body: Body,
}

/// Client supplied timestamps are advisory; anything that is not RFC 3339 is
/// treated as absent instead of failing the whole envelope.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Some(Raw::Other(_)) | None => None,
    })
}

impl Envelope {
    /// Wrap a body with no sender and no timestamp.
    #[must_use]
    pub fn new(body: Body) -> Self {
        Self {
            username: String::new(),
            timestamp: None,
            body,
        }
    }

    /// Set the sender.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Stamp the envelope with the current time.
    #[must_use]
    pub fn stamped(self) -> Self {
        self.with_timestamp(Utc::now())
    }

    /// Wire name of the envelope kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match &self.body {
            Body::Join { .. } => "join_channel",
            Body::Leave { .. } => "leave_channel",
            Body::Chat { .. } => "message",
            Body::MediaFrame { .. } => "media_frame",
            Body::UserJoined { .. } => "user_joined",
            Body::UserLeft { .. } => "user_left",
            Body::UserList { .. } => "user_list",
        }
    }

    /// The channel this envelope targets.
    #[must_use]
    pub fn channel(&self) -> &str {
        match &self.body {
            Body::Join { channel }
            | Body::Leave { channel }
            | Body::Chat { channel, .. }
            | Body::MediaFrame { channel, .. }
            | Body::UserJoined { channel }
            | Body::UserLeft { channel }
            | Body::UserList { channel, .. } => channel,
        }
    }

    /// Create a join request.
    #[must_use]
    pub fn join(username: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::new(Body::Join {
            channel: channel.into(),
        })
        .with_username(username)
    }

    /// Create a leave request.
    #[must_use]
    pub fn leave(channel: impl Into<String>) -> Self {
        Self::new(Body::Leave {
            channel: channel.into(),
        })
    }

    /// Create a chat message.
    #[must_use]
    pub fn chat(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Body::Chat {
            channel: channel.into(),
            content: content.into(),
        })
    }

    /// Create a media frame.
    #[must_use]
    pub fn media_frame(
        channel: impl Into<String>,
        audio_data: impl Into<String>,
        sample_rate: Option<u32>,
    ) -> Self {
        Self::new(Body::MediaFrame {
            channel: channel.into(),
            audio_data: audio_data.into(),
            sample_rate,
        })
    }

    /// Create a `user_joined` presence notice.
    #[must_use]
    pub fn user_joined(channel: impl Into<String>, username: impl Into<String>) -> Self {
        Self::new(Body::UserJoined {
            channel: channel.into(),
        })
        .with_username(username)
        .stamped()
    }

    /// Create a `user_left` presence notice.
    #[must_use]
    pub fn user_left(channel: impl Into<String>, username: impl Into<String>) -> Self {
        Self::new(Body::UserLeft {
            channel: channel.into(),
        })
        .with_username(username)
        .stamped()
    }

    /// Create a member list.
    #[must_use]
    pub fn user_list(channel: impl Into<String>, members: Vec<String>) -> Self {
        Self::new(Body::UserList {
            channel: channel.into(),
            data: members,
        })
        .stamped()
    }
}
