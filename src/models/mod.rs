//! Data models for the banter-link client library.
//!
//! Wire-facing types: the typed event variants decoded from the stream, the
//! per-room frame envelope, and the option structs that tune the command
//! queue and reconnection behavior.

mod envelope;
mod event;
mod options;

pub(crate) use envelope::parse_frame;
pub use event::{Event, EventType, Message, MessageRef, Presence};
pub use options::{QueueOptions, ReconnectOptions};
