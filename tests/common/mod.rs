//! In-process stand-in for the Banter platform.
//!
//! Serves the browser-oriented endpoints the client scrapes (login form,
//! chat pages, ticket handshake) plus the per-room websocket stream, all on
//! an ephemeral local port. Tests script failure responses per operation and
//! push event frames into connected streams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, Path, State};
use axum::http::header::{COOKIE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{AppendHeaders, Html, IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use serde_json::json;
use tokio::sync::mpsc;

pub const EMAIL: &str = "bot@example.com";
pub const PASSWORD: &str = "hunter2";
pub const USER_ID: u64 = 8421;
pub const LOGIN_FKEY: &str = "loginfkey0123";
pub const ROOM_FKEY: &str = "roomfkey4567";

/// Control messages for a connected event stream.
enum WsCtl {
    Frame(String),
    Close,
}

pub struct MockState {
    addr: Mutex<String>,
    login_requests: AtomicU32,
    /// Requests seen per logical operation, scripted or not.
    attempts: Mutex<HashMap<&'static str, u32>>,
    /// Scripted responses per logical operation, consumed front to back.
    scripts: Mutex<HashMap<&'static str, VecDeque<(u16, String)>>>,
    /// Live stream connections per room.
    streams: Mutex<HashMap<u64, Vec<mpsc::UnboundedSender<WsCtl>>>>,
    next_message_id: AtomicU64,
    next_event_id: AtomicU64,
    action_in_flight: AtomicUsize,
    max_action_in_flight: AtomicUsize,
}

impl MockState {
    fn new() -> Self {
        Self {
            addr: Mutex::new(String::new()),
            login_requests: AtomicU32::new(0),
            attempts: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_message_id: AtomicU64::new(100),
            next_event_id: AtomicU64::new(1000),
            action_in_flight: AtomicUsize::new(0),
            max_action_in_flight: AtomicUsize::new(0),
        }
    }

    fn record_attempt(&self, op: &'static str) {
        *self.attempts.lock().unwrap().entry(op).or_insert(0) += 1;
    }

    fn scripted_response(&self, op: &'static str) -> Option<(u16, String)> {
        self.scripts.lock().unwrap().get_mut(op)?.pop_front()
    }

    fn broadcast(&self, room_id: u64, frame: &str) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(senders) = streams.get_mut(&room_id) {
            senders.retain(|tx| tx.send(WsCtl::Frame(frame.to_string())).is_ok());
        }
    }
}

/// Running mock platform plus the handles tests use to drive it.
pub struct MockPlatform {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockPlatform {
    pub async fn start() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let state = Arc::new(MockState::new());
        let app = Router::new()
            .route("/users/login", get(login_page).post(login_submit))
            .route("/", get(probe_page))
            .route("/chats/join/favorite", get(probe_page))
            .route("/rooms/{room_id}", get(room_page))
            .route("/ws-auth", post(ws_auth))
            .route("/events/{room_id}", any(stream_upgrade))
            .route("/chats/{room_id}/messages/new", post(post_message))
            .route("/chats/leave/{room_id}", post(leave_room))
            .route("/messages/ack", post(ack_message))
            .route("/messages/{message_id}", post(edit_message))
            .route("/messages/{message_id}/{action}", post(message_action))
            .route("/admin/movePosts/{room_id}", post(move_posts))
            .route("/conversation/new", post(new_bookmark))
            .route("/conversation/delete/{room_id}/{title}", post(delete_bookmark))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock platform");
        let addr = listener.local_addr().expect("mock platform addr");
        let base_url = format!("http://{addr}");
        *state.addr.lock().unwrap() = addr.to_string();

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock platform serve");
        });

        Self { base_url, state }
    }

    /// `Server` pointing both hosts at this mock.
    pub fn server(&self) -> banter_link::Server {
        banter_link::Server::custom(self.base_url.as_str(), self.base_url.as_str())
    }

    pub fn login_count(&self) -> u32 {
        self.state.login_requests.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, op: &'static str) -> u32 {
        *self.state.attempts.lock().unwrap().get(op).unwrap_or(&0)
    }

    /// Queue responses for an operation; once drained, the default success
    /// response resumes.
    pub fn script(&self, op: &'static str, responses: Vec<(u16, &str)>) {
        let mut scripts = self.state.scripts.lock().unwrap();
        let entry = scripts.entry(op).or_default();
        for (status, body) in responses {
            entry.push_back((status, body.to_string()));
        }
    }

    pub fn max_actions_in_flight(&self) -> usize {
        self.state.max_action_in_flight.load(Ordering::SeqCst)
    }

    pub fn stream_count(&self, room_id: u64) -> usize {
        let mut streams = self.state.streams.lock().unwrap();
        match streams.get_mut(&room_id) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    /// Wait until `count` live stream connections exist for the room.
    pub async fn wait_for_streams(&self, room_id: u64, count: usize) {
        for _ in 0..500 {
            if self.stream_count(room_id) >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {room_id} never reached {count} stream connection(s)");
    }

    /// Push a raw envelope frame to every stream connected to the room.
    pub fn push_raw_frame(&self, room_id: u64, frame: &str) {
        self.state.broadcast(room_id, frame);
    }

    /// Push a frame carrying the given records, with the last record's id as
    /// the watermark.
    pub fn push_records(&self, room_id: u64, records: Vec<serde_json::Value>) {
        let watermark = records
            .last()
            .and_then(|r| r.get("id"))
            .and_then(serde_json::Value::as_u64);
        let mut body = json!({ "e": records });
        if let Some(t) = watermark {
            body["t"] = json!(t);
        }
        self.state.broadcast(room_id, &envelope(room_id, body).to_string());
    }

    /// Server-side close of every stream connected to the room.
    pub fn drop_streams(&self, room_id: u64) {
        let mut streams = self.state.streams.lock().unwrap();
        if let Some(senders) = streams.remove(&room_id) {
            for tx in senders {
                let _ = tx.send(WsCtl::Close);
            }
        }
    }
}

/// Wrap a room body in the platform's frame envelope.
pub fn envelope(room_id: u64, body: serde_json::Value) -> serde_json::Value {
    let mut frame = serde_json::Map::new();
    frame.insert(format!("r{room_id}"), body);
    serde_json::Value::Object(frame)
}

/// A message-posted record as the platform emits it.
pub fn message_record(event_id: u64, room_id: u64, message_id: u64, content: &str) -> serde_json::Value {
    json!({
        "event_type": 1,
        "id": event_id,
        "time_stamp": 1_700_000_000u64,
        "room_id": room_id,
        "room_name": "Test Room",
        "message_id": message_id,
        "user_id": USER_ID,
        "user_name": "test-bot",
        "content": content,
    })
}

/// A mention record as the platform emits it.
pub fn mention_record(event_id: u64, room_id: u64, message_id: u64, content: &str) -> serde_json::Value {
    json!({
        "event_type": 8,
        "id": event_id,
        "time_stamp": 1_700_000_000u64,
        "room_id": room_id,
        "room_name": "Test Room",
        "message_id": message_id,
        "user_id": 77,
        "user_name": "someone",
        "content": content,
    })
}

// ── Markup endpoints ────────────────────────────────────────────────────────

async fn login_page() -> Html<String> {
    Html(format!(
        r#"<html><body><form id="login-form">
        <input name="fkey" type="hidden" value="{LOGIN_FKEY}">
        <input name="email"><input name="password" type="password">
        </form></body></html>"#
    ))
}

async fn login_submit(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.login_requests.fetch_add(1, Ordering::SeqCst);
    let email = form.get("email").map(String::as_str).unwrap_or("");
    let password = form.get("password").map(String::as_str).unwrap_or("");
    let fkey = form.get("fkey").map(String::as_str).unwrap_or("");

    if email == EMAIL && password == PASSWORD && fkey == LOGIN_FKEY {
        (
            StatusCode::FOUND,
            AppendHeaders([
                (LOCATION, "/".to_string()),
                (SET_COOKIE, "acct=session-token; Path=/; HttpOnly".to_string()),
                (SET_COOKIE, "prov=prov-token; Path=/".to_string()),
            ]),
        )
            .into_response()
    } else {
        (StatusCode::OK, Html("<html>Login failed</html>")).into_response()
    }
}

fn signed_in(headers: &HeaderMap) -> bool {
    headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|cookies| cookies.contains("acct=session-token"))
        .unwrap_or(false)
}

async fn probe_page(headers: HeaderMap) -> Response {
    if signed_in(&headers) {
        let page = format!(
            r#"<html><body>
            <div class="topbar-menu-links"><a href="/users/{USER_ID}/test-bot">test-bot</a></div>
            <div id="content"><form><input id="fkey" type="hidden" value="{ROOM_FKEY}"></form></div>
            </body></html>"#
        );
        (
            AppendHeaders([(SET_COOKIE, "chatusr=chat-token; Path=/".to_string())]),
            Html(page),
        )
            .into_response()
    } else {
        Html(
            r#"<html><body>
            <div class="topbar-menu-links"><a href="/users/login">log in</a></div>
            </body></html>"#
                .to_string(),
        )
        .into_response()
    }
}

async fn room_page(headers: HeaderMap, Path(room_id): Path<u64>) -> Response {
    if !signed_in(&headers) {
        return (StatusCode::FORBIDDEN, "not signed in").into_response();
    }
    Html(format!(
        r#"<html><body><h1>Room {room_id}</h1>
        <input id="fkey" type="hidden" value="{ROOM_FKEY}">
        </body></html>"#
    ))
    .into_response()
}

// ── Stream endpoints ────────────────────────────────────────────────────────

async fn ws_auth(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.record_attempt("ws-auth");
    if let Some((status, body)) = state.scripted_response("ws-auth") {
        return scripted(status, body);
    }
    if form.get("fkey").map(String::as_str) != Some(ROOM_FKEY) {
        return (StatusCode::FORBIDDEN, "invalid fkey").into_response();
    }
    let room_id = form
        .get("roomid")
        .and_then(|id| id.parse::<u64>().ok())
        .unwrap_or(0);
    let addr = state.addr.lock().unwrap().clone();
    axum::Json(json!({ "url": format!("ws://{addr}/events/{room_id}") })).into_response()
}

async fn stream_upgrade(
    State(state): State<Arc<MockState>>,
    Path(room_id): Path<u64>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_connection(state, room_id, socket))
}

async fn stream_connection(state: Arc<MockState>, room_id: u64, mut socket: WebSocket) {
    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
    state
        .streams
        .lock()
        .unwrap()
        .entry(room_id)
        .or_default()
        .push(ctl_tx);

    loop {
        tokio::select! {
            ctl = ctl_rx.recv() => match ctl {
                Some(WsCtl::Frame(frame)) => {
                    if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(WsCtl::Close) | None => break,
            },
            // reading keeps protocol pings answered; payloads are ignored
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }
}

// ── Action endpoints ────────────────────────────────────────────────────────

fn scripted(status: u16, body: String) -> Response {
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    )
        .into_response()
}

/// Tracks overlapping action requests so tests can assert serial execution.
struct InFlightGuard(Arc<MockState>);

impl InFlightGuard {
    fn enter(state: &Arc<MockState>) -> Self {
        let current = state.action_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_action_in_flight.fetch_max(current, Ordering::SeqCst);
        Self(state.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.action_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn post_message(
    State(state): State<Arc<MockState>>,
    Path(room_id): Path<u64>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let _guard = InFlightGuard::enter(&state);
    state.record_attempt("send");
    // overlap window for the serialization test
    tokio::time::sleep(Duration::from_millis(20)).await;
    if let Some((status, body)) = state.scripted_response("send") {
        return scripted(status, body);
    }
    let text = form.get("text").cloned().unwrap_or_default();
    let message_id = state.next_message_id.fetch_add(1, Ordering::SeqCst);
    let event_id = state.next_event_id.fetch_add(1, Ordering::SeqCst);
    let record = message_record(event_id, room_id, message_id, &text);
    let frame = envelope(room_id, json!({ "e": [record], "t": event_id }));
    state.broadcast(room_id, &frame.to_string());
    axum::Json(json!({ "id": message_id })).into_response()
}

async fn edit_message(
    State(state): State<Arc<MockState>>,
    Path(_message_id): Path<u64>,
) -> Response {
    let _guard = InFlightGuard::enter(&state);
    state.record_attempt("edit");
    tokio::time::sleep(Duration::from_millis(20)).await;
    if let Some((status, body)) = state.scripted_response("edit") {
        return scripted(status, body);
    }
    "ok".into_response()
}

async fn message_action(
    State(state): State<Arc<MockState>>,
    Path((_message_id, action)): Path<(u64, String)>,
) -> Response {
    let _guard = InFlightGuard::enter(&state);
    state.record_attempt("message-action");
    tokio::time::sleep(Duration::from_millis(20)).await;
    if let Some((status, body)) = state.scripted_response("message-action") {
        return scripted(status, body);
    }
    match action.as_str() {
        "delete" | "star" | "unstar" | "owner-star" | "unowner-star" => "ok".into_response(),
        _ => (StatusCode::NOT_FOUND, "unknown action").into_response(),
    }
}

async fn ack_message(State(state): State<Arc<MockState>>) -> Response {
    state.record_attempt("ack");
    "ok".into_response()
}

async fn move_posts(
    State(state): State<Arc<MockState>>,
    Path(_room_id): Path<u64>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.record_attempt("move");
    if let Some((status, body)) = state.scripted_response("move") {
        return scripted(status, body);
    }
    let moved = form
        .get("ids")
        .map(|ids| ids.split(',').filter(|id| !id.is_empty()).count())
        .unwrap_or(0);
    moved.to_string().into_response()
}

async fn new_bookmark(State(state): State<Arc<MockState>>) -> Response {
    state.record_attempt("bookmark");
    if let Some((status, body)) = state.scripted_response("bookmark") {
        return scripted(status, body);
    }
    axum::Json(json!({ "ok": true })).into_response()
}

async fn delete_bookmark(
    State(state): State<Arc<MockState>>,
    Path((_room_id, _title)): Path<(u64, String)>,
) -> Response {
    state.record_attempt("delete-bookmark");
    "ok".into_response()
}

async fn leave_room(State(state): State<Arc<MockState>>, Path(_room_id): Path<u64>) -> Response {
    state.record_attempt("leave");
    "ok".into_response()
}
