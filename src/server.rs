//! Banter server endpoints.
//!
//! A [`Server`] is the pair of base URLs a session talks to: the chat host
//! (rooms, actions, event stream) and the login host (account
//! authentication). Both are plain HTTPS origins with no trailing slash.

use serde::{Deserialize, Serialize};

/// The host pair a set of credentials is valid for.
///
/// # Examples
///
/// ```rust
/// use banter_link::Server;
///
/// let server = Server::production();
/// assert_eq!(server.chat_url("/ws-auth"), "https://chat.banter.net/ws-auth");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    chat_base: String,
    login_base: String,
}

impl Server {
    /// The production Banter platform.
    pub fn production() -> Self {
        Self {
            chat_base: "https://chat.banter.net".to_string(),
            login_base: "https://www.banter.net".to_string(),
        }
    }

    /// A custom host pair, e.g. a staging deployment or a local test stand-in.
    pub fn custom(chat_base: impl Into<String>, login_base: impl Into<String>) -> Self {
        Self {
            chat_base: chat_base.into().trim_end_matches('/').to_string(),
            login_base: login_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Absolute URL for a path on the chat host.
    pub fn chat_url(&self, path: &str) -> String {
        format!("{}{}", self.chat_base, path)
    }

    /// Absolute URL for a path on the login host.
    pub fn login_url(&self, path: &str) -> String {
        format!("{}{}", self.login_base, path)
    }

    /// Origin value sent with the websocket upgrade request.
    pub fn origin(&self) -> &str {
        &self.chat_base
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::production()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_trims_trailing_slash() {
        let server = Server::custom("http://127.0.0.1:3000/", "http://127.0.0.1:3001/");
        assert_eq!(server.chat_url("/rooms/1"), "http://127.0.0.1:3000/rooms/1");
        assert_eq!(
            server.login_url("/users/login"),
            "http://127.0.0.1:3001/users/login"
        );
    }

    #[test]
    fn test_serialization_round_trip() {
        let server = Server::custom("http://a", "http://b");
        let json = serde_json::to_string(&server).unwrap();
        let back: Server = serde_json::from_str(&json).unwrap();
        assert_eq!(back, server);
    }
}
