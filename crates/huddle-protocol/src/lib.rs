//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle relay hub.
//!
//! ## Envelope kinds
//!
//! - `join_channel` / `leave_channel` - Channel membership
//! - `message` - Text messages and history replay
//! - `media_frame` - Opaque audio payloads (`audio_chunk`/`audio_data` accepted)
//! - `user_joined` / `user_left` / `user_list` - Presence, server originated
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::chat("general", "hello").with_username("alice");
//!
//! let text = codec::encode_json(&envelope).unwrap();
//! let decoded = codec::decode_json(&text).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, Encoded, EnvelopeCodec, ProtocolError, WireFormat};
pub use envelope::{Body, Envelope};
