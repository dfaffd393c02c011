//! Credential acquisition, validation, and persistence.
//!
//! The platform authenticates browsers, not clients: a login is a scripted
//! walk through the login form (fetch page, lift the anti-forgery token,
//! submit identity + secret, collect the session cookies). [`CredentialStore`]
//! owns that walk plus the credential file; [`Credentials`] is the immutable
//! product shared with every room.
//!
//! Re-authentication always builds a whole new [`Credentials`] value; the
//! shared one is never mutated in place, so concurrent readers cannot observe
//! a half-replaced session.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::header::{HeaderMap, COOKIE, LOCATION, REFERER, SET_COOKIE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{BanterLinkError, Result};
use crate::scrape::{ArcMarkupAdapter, DefaultMarkup};
use crate::server::Server;
use crate::timeouts::BanterLinkTimeouts;

/// User agent sent with every request, HTTP and websocket alike.
pub(crate) const CLIENT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; banter-link/0.1; +https://crates.io/crates/banter-link)";

/// Probe page that works for any signed-in account and carries both the
/// profile link and a session fkey.
const PROBE_PATH: &str = "/chats/join/favorite";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One cookie captured from a `Set-Cookie` response header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
}

/// An authenticated platform session.
///
/// Either fully valid for all endpoints or replaced wholesale by
/// re-authentication; never partially mutated. Round-trips exactly through
/// the credential file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Host pair this session is valid for.
    pub server: Server,
    /// Session cookie set captured during login.
    pub cookies: Vec<StoredCookie>,
    /// Chat user id of the authenticated account.
    pub user_id: u64,
    /// Session-scoped anti-forgery token. Rooms fetch their own.
    pub fkey: String,
    /// When this session was acquired, in milliseconds since the epoch.
    pub acquired_at_ms: u64,
}

impl Credentials {
    /// The `Cookie` header value for requests on this session.
    pub(crate) fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Build the HTTP side of a session from these credentials.
    pub(crate) fn session(&self, timeouts: &BanterLinkTimeouts) -> Result<Session> {
        let mut headers = HeaderMap::new();
        let cookie_header = self.cookie_header();
        headers.insert(
            COOKIE,
            cookie_header
                .parse()
                .map_err(|_| BanterLinkError::Configuration("unencodable cookie value".into()))?,
        );
        headers.insert(
            USER_AGENT,
            reqwest::header::HeaderValue::from_static(CLIENT_USER_AGENT),
        );
        headers.insert(
            REFERER,
            self.server
                .origin()
                .parse()
                .map_err(|_| BanterLinkError::Configuration("unencodable server origin".into()))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeouts.request)
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|e| BanterLinkError::Configuration(e.to_string()))?;

        Ok(Session {
            http,
            server: self.server.clone(),
            cookie_header,
        })
    }
}

/// Cheap-to-clone HTTP handle shared by a room's queue and listener.
#[derive(Clone)]
pub(crate) struct Session {
    pub http: reqwest::Client,
    pub server: Server,
    /// Kept separately because the websocket upgrade request needs it as an
    /// explicit header.
    pub cookie_header: String,
}

/// Acquires and persists authenticated sessions.
///
/// # Examples
///
/// ```rust,no_run
/// use banter_link::{CredentialStore, Server};
///
/// # async fn example() -> banter_link::Result<()> {
/// let store = CredentialStore::new(Server::production());
/// let credentials = store
///     .load_or_authenticate("banter-credentials.json", "bot@example.com", "hunter2")
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct CredentialStore {
    server: Server,
    markup: ArcMarkupAdapter,
    /// Login flow must observe redirect statuses itself.
    http: reqwest::Client,
    /// Serializes load/authenticate/persist cycles on the credential file.
    file_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(server: Server) -> Self {
        Self::with_markup(server, std::sync::Arc::new(DefaultMarkup::new()))
    }

    /// Use a custom [`MarkupAdapter`](crate::MarkupAdapter) for a markup
    /// revision the built-in one does not understand.
    pub fn with_markup(server: Server, markup: ArcMarkupAdapter) -> Self {
        Self {
            server,
            markup,
            http: Self::build_login_client(&BanterLinkTimeouts::default()),
            file_lock: Mutex::new(()),
        }
    }

    /// Replace the default timeouts on the store's own requests.
    pub fn with_timeouts(mut self, timeouts: BanterLinkTimeouts) -> Self {
        self.http = Self::build_login_client(&timeouts);
        self
    }

    fn build_login_client(timeouts: &BanterLinkTimeouts) -> reqwest::Client {
        reqwest::Client::builder()
            .user_agent(CLIENT_USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeouts.request)
            .connect_timeout(timeouts.connect)
            .build()
            .expect("static client configuration")
    }

    /// Load and validate credentials from `path`, or log in if they are
    /// missing or stale.
    ///
    /// With an already-valid file this issues zero login requests, which
    /// matters: the platform answers repeated logins with a CAPTCHA. Fails
    /// with [`BanterLinkError::AuthenticationFailure`] on rejected
    /// identity/secret (nothing is written) and
    /// [`BanterLinkError::SessionProbeFailed`] when validity could not be
    /// checked at all; retry the call rather than re-authenticating.
    pub async fn load_or_authenticate(
        &self,
        path: impl AsRef<Path>,
        email: &str,
        password: &str,
    ) -> Result<Credentials> {
        let path = path.as_ref();
        let _guard = self.file_lock.lock().await;

        if let Some(credentials) = Self::load_file(path).await? {
            if self.probe(&credentials).await? {
                log::info!("[banter-link] reusing persisted session from {}", path.display());
                return Ok(credentials);
            }
            log::info!(
                "[banter-link] persisted session in {} is stale, re-authenticating",
                path.display()
            );
        }

        let credentials = self.authenticate(email, password).await?;
        if !self.probe(&credentials).await? {
            return Err(BanterLinkError::AuthenticationFailure(
                "freshly acquired session failed its validity probe".to_string(),
            ));
        }
        Self::save_atomic(path, &credentials).await?;
        log::info!("[banter-link] saved credentials to {}", path.display());
        Ok(credentials)
    }

    /// Perform the full login walk unconditionally.
    ///
    /// Prefer [`load_or_authenticate`](Self::load_or_authenticate); every
    /// call here is a real login attempt and too many of them trip the
    /// platform's CAPTCHA.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Credentials> {
        log::info!("[banter-link] logging in via {}", self.server.login_url(""));
        let mut cookies: Vec<StoredCookie> = Vec::new();

        // 1. Login page: anti-forgery token + any pre-session cookies.
        let response = self.http.get(self.server.login_url("/users/login")).send().await?;
        capture_cookies(response.headers(), &mut cookies);
        let page = response.text().await?;
        let login_fkey = self.markup.login_fkey(&page).ok_or_else(|| {
            BanterLinkError::Protocol("login page did not contain an fkey token".to_string())
        })?;
        log::debug!("[banter-link] login fkey acquired");

        // 2. Submit the form. Success is a redirect to the site root;
        //    anything else is a rejection (or a CAPTCHA interception).
        let response = self
            .http
            .post(self.server.login_url("/users/login"))
            .form(&[
                ("email", email),
                ("password", password),
                ("fkey", &login_fkey),
                ("ssrc", "head"),
            ])
            .send()
            .await?;
        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        capture_cookies(response.headers(), &mut cookies);
        if status != StatusCode::FOUND {
            return Err(BanterLinkError::AuthenticationFailure(format!(
                "login responded with {status}; incorrect email or password?"
            )));
        }
        if location != "/" {
            return Err(BanterLinkError::AuthenticationFailure(format!(
                "login redirected to {location:?}; caught by a CAPTCHA?"
            )));
        }
        log::debug!("[banter-link] login accepted");

        // 3. Visit the chat host to pick up its session cookie, the chat
        //    user id, and the session fkey.
        let response = self
            .http
            .get(self.server.chat_url(PROBE_PATH))
            .header(COOKIE, join_cookies(&cookies))
            .send()
            .await?;
        capture_cookies(response.headers(), &mut cookies);
        let page = response.text().await?;
        let user_id = self.markup.profile_user_id(&page).ok_or_else(|| {
            BanterLinkError::AuthenticationFailure(
                "the chat host did not accept the login session".to_string(),
            )
        })?;
        let fkey = self.markup.room_fkey(&page).ok_or_else(|| {
            BanterLinkError::Protocol("chat page did not contain an fkey token".to_string())
        })?;

        log::info!("[banter-link] logged in as chat user {user_id}");
        Ok(Credentials {
            server: self.server.clone(),
            cookies,
            user_id,
            fkey,
            acquired_at_ms: now_ms(),
        })
    }

    /// Lightweight session-validity check.
    ///
    /// `Ok(true)`: the session is usable. `Ok(false)`: the platform no
    /// longer recognizes it (expired or wrong account). `Err`: the probe
    /// itself could not be completed.
    async fn probe(&self, credentials: &Credentials) -> Result<bool> {
        let response = self
            .http
            .get(self.server.chat_url(PROBE_PATH))
            .header(COOKIE, credentials.cookie_header())
            .send()
            .await
            .map_err(|e| BanterLinkError::SessionProbeFailed(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BanterLinkError::SessionProbeFailed(format!(
                "probe request answered with {status}"
            )));
        }
        if !status.is_success() {
            // redirected to login or refused outright: session is stale
            return Ok(false);
        }

        let page = response
            .text()
            .await
            .map_err(|e| BanterLinkError::SessionProbeFailed(e.to_string()))?;
        match self.markup.profile_user_id(&page) {
            Some(user_id) if user_id == credentials.user_id => Ok(true),
            Some(user_id) => {
                log::warn!(
                    "[banter-link] persisted session belongs to user {user_id}, expected {}",
                    credentials.user_id
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn load_file(path: &Path) -> Result<Option<Credentials>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                log::warn!(
                    "[banter-link] credential file {} is unreadable ({e}); will re-authenticate",
                    path.display()
                );
                Ok(None)
            }
        }
    }

    /// Replace the credential file atomically: write a sibling temp file,
    /// then rename over the target.
    async fn save_atomic(path: &Path, credentials: &Credentials) -> Result<()> {
        let json = serde_json::to_vec_pretty(credentials)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn join_cookies(cookies: &[StoredCookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fold every `Set-Cookie` header into the stored set, replacing same-name
/// cookies in place.
fn capture_cookies(headers: &HeaderMap, cookies: &mut Vec<StoredCookie>) {
    for value in headers.get_all(SET_COOKIE) {
        let raw = match value.to_str() {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        let pair = match raw.split(';').next() {
            Some(pair) => pair,
            None => continue,
        };
        let (name, value) = match pair.split_once('=') {
            Some(split) => split,
            None => continue,
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            continue;
        }
        if let Some(existing) = cookies.iter_mut().find(|c| c.name == name) {
            existing.value = value.to_string();
        } else {
            cookies.push(StoredCookie {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }
}
