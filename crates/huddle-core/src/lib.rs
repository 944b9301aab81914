//! # huddle-core
//!
//! Channel membership, broadcast fan-out and media relay for the Huddle hub.
//!
//! - **Session** - Live connections and their exclusive write path
//! - **Channel** - Participants of a named channel and their media routes
//! - **Membership** - Join, leave and disconnect cleanup
//! - **Fan-out** - Concurrent per-recipient delivery with eviction
//! - **Relay** - Opaque media frame forwarding
//! - **Store** - Chat persistence gateway
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│     Hub     │────▶│ Membership  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │         │              │
//!                 chat  ▼         ▼ media        ▼
//!              ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!              │    Store    │ │    Relay    │ │   Fan-out   │
//!              └─────────────┘ └─────────────┘ └─────────────┘
//! ```

pub mod channel;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod membership;
pub mod relay;
pub mod session;
pub mod store;

pub use channel::{Channel, ChannelDirectory, ChannelId, Participant};
pub use error::{HubError, MembershipError};
pub use fanout::{Broadcaster, FanoutReport};
pub use hub::{Hub, HubConfig, HubStats};
pub use membership::{MembershipManager, MembershipSnapshot};
pub use relay::{MediaRelay, MediaRoute};
pub use session::{Session, SessionId, SessionRegistry};
pub use store::{HistoryEntry, MemoryStore, MessageStore, PersistError};
