//! Websocket connection management for the room event stream.
//!
//! This module contains:
//! - [`websocket`]: low-level helpers (ticket handshake, upgrade request with
//!   session headers, reconnect backoff)
//! - [`listener`]: the per-room listener task (read loop, idle/heartbeat
//!   health check, dedup, bounded reconnection)

pub(crate) mod listener;
pub(crate) mod websocket;

pub(crate) use listener::{listener_task, ListenerContext};

/// Capacity of the per-room decoded-event channel between listener and
/// dispatcher.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Recently-delivered sequence ids remembered for reconnect deduplication.
pub(crate) const DEDUP_WINDOW_CAPACITY: usize = 4096;

/// Maximum accepted text frame size (4 MiB); larger frames are dropped.
pub(crate) const MAX_FRAME_BYTES: usize = 4 << 20;

/// Stands in for "no deadline" (~100 years) without overflowing
/// `Instant::now() + dur`.
pub(crate) const FAR_FUTURE: std::time::Duration =
    std::time::Duration::from_secs(100 * 365 * 24 * 3600);
