//! Low-level websocket helpers: ticket handshake and stream connection.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, ORIGIN, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::MaybeTlsStream;
use url::Url;

use crate::credentials::{Session, CLIENT_USER_AGENT};
use crate::error::{BanterLinkError, Result};

pub(crate) type WebSocketStream =
    tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Trade the room fkey for a single-use stream ticket.
///
/// The returned URL is valid for one connection attempt and expires within
/// seconds, so it is re-fetched on every (re)connect. `resume` is the last
/// observed envelope watermark; the platform replays a short backlog from
/// there.
pub(crate) async fn fetch_ticket(
    session: &Session,
    room_id: u64,
    fkey: &str,
    resume: Option<u64>,
) -> Result<Url> {
    let response = session
        .http
        .post(session.server.chat_url("/ws-auth"))
        .form(&[("roomid", room_id.to_string()), ("fkey", fkey.to_string())])
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(BanterLinkError::TransientNetwork(format!(
                "ticket handshake answered {status}"
            )));
        }
        // 4xx: stale fkey or revoked access; the listener reacts by
        // re-scraping the room fkey before the next attempt.
        return Err(BanterLinkError::ActionRejected {
            status: status.as_u16(),
            message: body,
        });
    }

    let body: serde_json::Value = response.json().await?;
    let raw_url = body
        .get("url")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            BanterLinkError::Protocol("ticket response did not contain a stream url".to_string())
        })?;

    let mut url = Url::parse(raw_url)
        .map_err(|e| BanterLinkError::Protocol(format!("unusable stream url {raw_url:?}: {e}")))?;
    let resume_from = resume.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    });
    url.query_pairs_mut()
        .append_pair("l", &resume_from.to_string());
    Ok(url)
}

/// Open the event stream using a freshly fetched ticket.
///
/// The upgrade request must look like the browser the session belongs to:
/// same cookies, same user agent, and the chat host as origin.
pub(crate) async fn connect_stream(
    session: &Session,
    ticket_url: &Url,
    handshake_timeout: Duration,
) -> Result<WebSocketStream> {
    let mut request = ticket_url
        .as_str()
        .into_client_request()
        .map_err(|e| BanterLinkError::WebSocket(format!("failed to build upgrade request: {e}")))?;

    let headers = request.headers_mut();
    headers.insert(
        COOKIE,
        HeaderValue::from_str(&session.cookie_header)
            .map_err(|_| BanterLinkError::Configuration("unencodable cookie value".into()))?,
    );
    headers.insert(
        ORIGIN,
        HeaderValue::from_str(session.server.origin())
            .map_err(|_| BanterLinkError::Configuration("unencodable server origin".into()))?,
    );
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    let connect = tokio_tungstenite::connect_async(request);
    let (stream, _response) = match tokio::time::timeout(handshake_timeout, connect).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => {
            return Err(BanterLinkError::WebSocket(format!("stream connect failed: {e}")))
        }
        Err(_) => {
            return Err(BanterLinkError::Timeout(format!(
                "stream connect exceeded {handshake_timeout:?}"
            )))
        }
    };
    Ok(stream)
}

/// Exponential reconnect delay with up to +50% jitter.
pub(crate) fn reconnect_delay(initial: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let delay = initial.saturating_mul(factor).min(cap);
    if delay.is_zero() {
        return delay;
    }
    let extra_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
    (delay + Duration::from_millis(extra_ms)).min(cap)
}
