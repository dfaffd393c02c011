//! # banter-link: Banter chat client library
//!
//! A client for the Banter realtime chat platform. The platform only speaks
//! to browsers (login forms, scraped anti-forgery tokens, cookie sessions,
//! and a websocket event stream behind a single-use ticket handshake), so
//! this crate does the browser's work: it acquires and persists a session,
//! joins rooms, sends and manages messages under the platform's rate limits,
//! and delivers decoded room events to registered handlers.
//!
//! ## Features
//!
//! - **Credential reuse**: sessions are persisted and revalidated so repeat
//!   runs issue zero login requests (repeated logins trip a CAPTCHA)
//! - **Per-room serial command queue**: rate limiting, adaptive pacing, and
//!   bounded retry with idempotency-aware policies
//! - **Resilient event stream**: idle/heartbeat health checks, bounded
//!   reconnection with backoff and jitter, exactly-once event delivery
//!   across reconnects
//! - **Typed events**: stream envelopes decode into [`Event`] variants;
//!   unrecognized tags are preserved, not dropped
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use banter_link::{CredentialStore, Event, EventType, Room, Server};
//!
//! #[tokio::main]
//! async fn main() -> banter_link::Result<()> {
//!     let store = CredentialStore::new(Server::production());
//!     let credentials = store
//!         .load_or_authenticate("credentials.json", "bot@example.com", "hunter2")
//!         .await?;
//!
//!     let mut room = Room::join(&credentials, 240).await?;
//!     room.on(EventType::MessagePosted, |event: &Event| {
//!         if let Event::MessagePosted(message) = event {
//!             println!("<{}> {}", message.user_name, message.content);
//!         }
//!     });
//!
//!     let message_id = room.send("hello!").await?;
//!     room.star(message_id).await?;
//!     room.leave().await?;
//!     Ok(())
//! }
//! ```

pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod room;
pub mod scrape;
pub mod server;
pub mod timeouts;

mod connection;
mod queue;

// Re-export main types for convenience
pub use credentials::{CredentialStore, Credentials, StoredCookie};
pub use dispatch::EventHandler;
pub use error::{BanterLinkError, Result};
pub use models::{
    Event, EventType, Message, MessageRef, Presence, QueueOptions, ReconnectOptions,
};
pub use room::{CloseReason, Room, RoomOptions, RoomState};
pub use scrape::{ArcMarkupAdapter, DefaultMarkup, MarkupAdapter};
pub use server::Server;
pub use timeouts::BanterLinkTimeouts;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
