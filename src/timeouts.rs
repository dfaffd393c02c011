//! Timeout configuration for banter-link client operations.
//!
//! Centralizes the independent deadlines used across the crate: connection
//! establishment, per-request HTTP deadlines, websocket idle detection, and
//! the handshake that trades a ticket for a stream.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout configuration for all client operations.
///
/// # Examples
///
/// ```rust
/// use banter_link::BanterLinkTimeouts;
/// use std::time::Duration;
///
/// // Defaults are tuned for the production platform.
/// let timeouts = BanterLinkTimeouts::default();
///
/// // Aggressive deadlines for a local test stand-in.
/// let timeouts = BanterLinkTimeouts::fast();
///
/// let custom = BanterLinkTimeouts {
///     request: Duration::from_secs(60),
///     ..BanterLinkTimeouts::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanterLinkTimeouts {
    /// TCP + TLS connection establishment.
    pub connect: Duration,

    /// Deadline for each outgoing HTTP request (command execution, markup
    /// fetches, the credential probe).
    pub request: Duration,

    /// Deadline for the ticket handshake plus websocket upgrade.
    pub handshake: Duration,

    /// Maximum silence on the event stream before the listener sends a
    /// protocol ping to check whether the connection is still alive.
    pub read_idle: Duration,

    /// Maximum wait for any frame after a keepalive ping; exceeding it marks
    /// the connection dead and triggers a reconnect.
    pub pong: Duration,

    /// Age at which a healthy socket is proactively cycled. The platform
    /// quietly stops delivering on very old connections, so the listener
    /// reconnects before that happens. `Duration::ZERO` disables cycling.
    pub socket_reset: Duration,
}

impl Default for BanterLinkTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(30),
            handshake: Duration::from_secs(10),
            read_idle: Duration::from_secs(45),
            pong: Duration::from_secs(10),
            socket_reset: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl BanterLinkTimeouts {
    /// Short deadlines suitable for localhost development and tests.
    pub fn fast() -> Self {
        Self {
            connect: Duration::from_secs(2),
            request: Duration::from_secs(5),
            handshake: Duration::from_secs(2),
            read_idle: Duration::from_secs(5),
            pong: Duration::from_secs(2),
            socket_reset: Duration::ZERO,
        }
    }

    /// Long deadlines for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connect: Duration::from_secs(30),
            request: Duration::from_secs(90),
            handshake: Duration::from_secs(30),
            read_idle: Duration::from_secs(120),
            pong: Duration::from_secs(30),
            socket_reset: Duration::from_secs(2 * 60 * 60),
        }
    }
}
