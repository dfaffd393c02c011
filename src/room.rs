//! Per-room session façade.
//!
//! A [`Room`] composes the command queue, the stream listener, and the event
//! dispatcher for one joined room and owns their lifecycles. All public
//! actions and handler registration happen here.

use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::{listener_task, ListenerContext, EVENT_CHANNEL_CAPACITY};
use crate::credentials::Credentials;
use crate::dispatch::{dispatch_loop, EventHandler, HandlerRegistry};
use crate::error::{BanterLinkError, Result};
use crate::models::{Event, EventType, QueueOptions, ReconnectOptions};
use crate::queue::{CommandQueue, Idempotency};
use crate::scrape::{ArcMarkupAdapter, DefaultMarkup};
use crate::timeouts::BanterLinkTimeouts;

/// Why a room reached [`RoomState::Closed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `leave()` was called (or the room was dropped).
    Left,
    /// Reconnection attempts were exhausted; see
    /// [`BanterLinkError::ConnectionLost`].
    ConnectionLost { attempts: u32 },
}

/// Lifecycle state of a room, observable via [`Room::watch_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomState {
    /// Handshaking: room page fetched, ticket requested, stream opening.
    Joining,
    /// Stream open; events flowing, actions accepted.
    Connected,
    /// Stream lost; ticket re-fetch and reconnect in progress.
    Reconnecting,
    /// Terminal. `reason` distinguishes a deliberate leave from exhausted
    /// reconnection.
    Closed { reason: CloseReason },
}

/// Options accepted by [`Room::join_with_options`].
pub struct RoomOptions {
    pub timeouts: BanterLinkTimeouts,
    pub queue: QueueOptions,
    pub reconnect: ReconnectOptions,
    /// Override the markup adapter used for room-fkey extraction.
    pub markup: Option<ArcMarkupAdapter>,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            timeouts: BanterLinkTimeouts::default(),
            queue: QueueOptions::default(),
            reconnect: ReconnectOptions::default(),
            markup: None,
        }
    }
}

/// A joined chat room.
///
/// Dropping a room shuts its tasks down best-effort; call
/// [`leave`](Room::leave) for an orderly exit that notifies the platform.
///
/// # Examples
///
/// ```rust,no_run
/// use banter_link::{CredentialStore, EventType, Event, Room, Server};
///
/// # async fn example() -> banter_link::Result<()> {
/// let store = CredentialStore::new(Server::production());
/// let credentials = store
///     .load_or_authenticate("credentials.json", "bot@example.com", "hunter2")
///     .await?;
///
/// let mut room = Room::join(&credentials, 240).await?;
/// room.on(EventType::Mentioned, |event: &Event| {
///     if let Event::Mentioned(message) = event {
///         println!("{} pinged us: {}", message.user_name, message.content);
///     }
/// });
/// let message_id = room.send("hello from banter-link").await?;
/// room.edit(message_id, "hello again").await?;
/// room.leave().await?;
/// # Ok(())
/// # }
/// ```
pub struct Room {
    room_id: u64,
    user_id: u64,
    fkey: Arc<RwLock<String>>,
    registry: Arc<HandlerRegistry>,
    queue: CommandQueue,
    queue_shutdown: watch::Sender<bool>,
    queue_task: Option<JoinHandle<()>>,
    listener_close: Option<oneshot::Sender<()>>,
    listener_task: Option<JoinHandle<()>>,
    dispatch_task: Option<JoinHandle<()>>,
    state_rx: watch::Receiver<RoomState>,
}

impl Room {
    /// Join a room with default options.
    pub async fn join(credentials: &Credentials, room_id: u64) -> Result<Room> {
        Self::join_with_options(credentials, room_id, RoomOptions::default()).await
    }

    /// Join a room.
    ///
    /// Fetches the room page for its fkey, starts the command queue and
    /// dispatcher, opens the event stream, and waits for the first
    /// connection to settle. Every failure path tears down whatever was
    /// already started before returning.
    pub async fn join_with_options(
        credentials: &Credentials,
        room_id: u64,
        options: RoomOptions,
    ) -> Result<Room> {
        let RoomOptions {
            timeouts,
            queue: queue_options,
            reconnect,
            markup,
        } = options;
        let markup = markup.unwrap_or_else(|| Arc::new(DefaultMarkup::new()));
        let session = credentials.session(&timeouts)?;

        log::info!("[banter-link] joining room {room_id}");
        let response = session
            .http
            .get(session.server.chat_url(&format!("/rooms/{room_id}")))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BanterLinkError::ActionRejected {
                status: status.as_u16(),
                message: format!("room {room_id} page could not be loaded"),
            });
        }
        let page = response.text().await?;
        let fkey = markup.room_fkey(&page).ok_or_else(|| {
            BanterLinkError::Protocol("room page did not contain an fkey token".to_string())
        })?;
        let fkey = Arc::new(RwLock::new(fkey));

        let (state_tx, state_rx) = watch::channel(RoomState::Joining);
        let (queue, queue_shutdown, queue_task) =
            CommandQueue::spawn(session.clone(), fkey.clone(), queue_options);
        let registry = Arc::new(HandlerRegistry::new());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let dispatch_task = tokio::spawn(dispatch_loop(
            room_id,
            events_rx,
            registry.clone(),
            queue.clone(),
        ));

        let (close_tx, close_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let ctx = ListenerContext {
            session,
            room_id,
            fkey: fkey.clone(),
            markup,
            timeouts,
            reconnect,
            events_tx,
            state_tx,
        };
        let listener = tokio::spawn(listener_task(ctx, close_rx, ready_tx));

        let ready = match ready_rx.await {
            Ok(ready) => ready,
            Err(_) => Err(BanterLinkError::WebSocket(
                "listener exited before signalling readiness".to_string(),
            )),
        };
        if let Err(e) = ready {
            // joined nothing: stop what was started and surface the error
            let _ = queue_shutdown.send(true);
            let _ = listener.await;
            let _ = queue_task.await;
            let _ = dispatch_task.await;
            return Err(e);
        }

        Ok(Room {
            room_id,
            user_id: credentials.user_id,
            fkey,
            registry,
            queue,
            queue_shutdown,
            queue_task: Some(queue_task),
            listener_close: Some(close_tx),
            listener_task: Some(listener),
            dispatch_task: Some(dispatch_task),
            state_rx,
        })
    }

    /// Register a handler for an event type.
    ///
    /// Multiple handlers per type are allowed; all of them run for a
    /// matching event, in registration order, on the dispatcher task.
    pub fn on(&self, event_type: EventType, handler: impl Fn(&Event) + Send + Sync + 'static) {
        self.registry.register(event_type, Arc::new(handler) as EventHandler);
    }

    /// Route an action through the queue, refusing it outright when the room
    /// has already reached its terminal state.
    async fn submit(
        &self,
        route: String,
        params: Vec<(String, String)>,
        idempotency: Idempotency,
    ) -> Result<String> {
        match self.state() {
            RoomState::Closed {
                reason: CloseReason::ConnectionLost { attempts },
            } => return Err(BanterLinkError::ConnectionLost { attempts }),
            RoomState::Closed { .. } => return Err(BanterLinkError::Cancelled),
            _ => {}
        }
        self.queue.submit(route, params, idempotency).await
    }

    /// Post a message. Returns the new message id.
    pub async fn send(&self, text: impl Into<String>) -> Result<u64> {
        let text = text.into();
        if text.is_empty() {
            return Err(BanterLinkError::Configuration(
                "cannot send an empty message".to_string(),
            ));
        }
        let body = self
            .submit(
                format!("/chats/{}/messages/new", self.room_id),
                vec![("text".to_string(), text)],
                Idempotency::NonIdempotent,
            )
            .await?;
        parse_message_id(&body)
    }

    /// Post a message as a reply to `parent_id`. Returns the new message id.
    pub async fn reply(&self, parent_id: u64, text: impl Into<String>) -> Result<u64> {
        self.send(format!(":{parent_id} {}", text.into())).await
    }

    /// Replace a message's body. Only recent own messages are editable;
    /// anything else is an [`BanterLinkError::ActionRejected`].
    pub async fn edit(&self, message_id: u64, new_body: impl Into<String>) -> Result<()> {
        let body = self
            .submit(
                format!("/messages/{message_id}"),
                vec![("text".to_string(), new_body.into())],
                Idempotency::NonIdempotent,
            )
            .await?;
        expect_ok(&body)
    }

    /// Delete a message.
    pub async fn delete(&self, message_id: u64) -> Result<()> {
        self.message_action(message_id, "delete", Idempotency::NonIdempotent)
            .await
    }

    /// Star a message.
    pub async fn star(&self, message_id: u64) -> Result<()> {
        self.message_action(message_id, "star", Idempotency::Idempotent)
            .await
    }

    /// Remove this account's star from a message.
    pub async fn unstar(&self, message_id: u64) -> Result<()> {
        self.message_action(message_id, "unstar", Idempotency::Idempotent)
            .await
    }

    /// Pin a message (room-owner star).
    pub async fn pin(&self, message_id: u64) -> Result<()> {
        self.message_action(message_id, "owner-star", Idempotency::Idempotent)
            .await
    }

    /// Unpin a message.
    pub async fn unpin(&self, message_id: u64) -> Result<()> {
        self.message_action(message_id, "unowner-star", Idempotency::Idempotent)
            .await
    }

    async fn message_action(
        &self,
        message_id: u64,
        action: &str,
        idempotency: Idempotency,
    ) -> Result<()> {
        let body = self
            .submit(
                format!("/messages/{message_id}/{action}"),
                Vec::new(),
                idempotency,
            )
            .await?;
        expect_ok(&body)
    }

    /// Move messages out of this room into `target_room`. Requires room
    /// ownership.
    pub async fn move_messages(&self, message_ids: &[u64], target_room: u64) -> Result<()> {
        if message_ids.is_empty() {
            return Err(BanterLinkError::Configuration(
                "no messages selected to move".to_string(),
            ));
        }
        let ids = message_ids
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let body = self
            .submit(
                format!("/admin/movePosts/{}", self.room_id),
                vec![
                    ("to".to_string(), target_room.to_string()),
                    ("ids".to_string(), ids),
                ],
                Idempotency::NonIdempotent,
            )
            .await?;
        if body.trim() != message_ids.len().to_string() {
            return Err(BanterLinkError::ActionRejected {
                status: 200,
                message: format!("platform moved {} of {} messages", body.trim(), message_ids.len()),
            });
        }
        Ok(())
    }

    /// Bookmark a conversation spanning `first_message` to `last_message`.
    pub async fn bookmark(
        &self,
        first_message: u64,
        last_message: u64,
        title: impl Into<String>,
    ) -> Result<()> {
        let body = self
            .submit(
                "/conversation/new".to_string(),
                vec![
                    ("roomId".to_string(), self.room_id.to_string()),
                    ("firstMessageId".to_string(), first_message.to_string()),
                    ("lastMessageId".to_string(), last_message.to_string()),
                    ("title".to_string(), title.into()),
                ],
                Idempotency::Idempotent,
            )
            .await?;
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| BanterLinkError::Protocol(format!("unexpected bookmark response {body:?}")))?;
        if value.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
            return Err(BanterLinkError::ActionRejected {
                status: 200,
                message: format!("bookmark was refused: {body}"),
            });
        }
        Ok(())
    }

    /// Delete a bookmark by title.
    pub async fn delete_bookmark(&self, title: impl AsRef<str>) -> Result<()> {
        let body = self
            .submit(
                format!("/conversation/delete/{}/{}", self.room_id, title.as_ref()),
                Vec::new(),
                Idempotency::Idempotent,
            )
            .await?;
        expect_ok(&body)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RoomState {
        self.state_rx.borrow().clone()
    }

    /// A receiver that observes lifecycle transitions, including the
    /// terminal `Closed { ConnectionLost }` after exhausted reconnects.
    pub fn watch_state(&self) -> watch::Receiver<RoomState> {
        self.state_rx.clone()
    }

    /// `true` once the room has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), RoomState::Closed { .. })
    }

    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    /// Chat user id of the account this room was joined with.
    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    /// Current room-scoped fkey (rotates independently of the session token).
    pub fn fkey(&self) -> String {
        self.fkey.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Leave the room.
    ///
    /// Notifies the platform (best-effort), stops the listener, cancels
    /// queued commands that never started, settles or cancels the in-flight
    /// one per [`QueueOptions::drain_on_close`], and transitions to
    /// `Closed`. Safe to call multiple times.
    pub async fn leave(&mut self) -> Result<()> {
        if self.listener_task.is_none() {
            return Ok(());
        }
        log::info!("[banter-link] leaving room {}", self.room_id);

        if !self.is_closed() {
            let leave_route = format!("/chats/leave/{}", self.room_id);
            let params = vec![("quiet".to_string(), "true".to_string())];
            if let Err(e) = self
                .queue
                .submit(leave_route, params, Idempotency::Idempotent)
                .await
            {
                log::debug!("[banter-link] leave notification failed: {e}");
            }
        }

        if let Some(close) = self.listener_close.take() {
            let _ = close.send(());
        }
        if let Some(task) = self.listener_task.take() {
            let _ = task.await;
        }
        let _ = self.queue_shutdown.send(true);
        if let Some(task) = self.queue_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.dispatch_task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        // best-effort shutdown when leave() was never called
        if let Some(close) = self.listener_close.take() {
            let _ = close.send(());
        }
        let _ = self.queue_shutdown.send(true);
    }
}

fn parse_message_id(body: &str) -> Result<u64> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|_| BanterLinkError::Protocol(format!("unexpected send response {body:?}")))?;
    value
        .get("id")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| {
            BanterLinkError::Protocol(format!("send response carried no message id: {body}"))
        })
}

fn expect_ok(body: &str) -> Result<()> {
    if body.trim() == "ok" {
        Ok(())
    } else {
        Err(BanterLinkError::ActionRejected {
            status: 200,
            message: format!("platform refused the action: {body}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_id() {
        assert_eq!(parse_message_id(r#"{"id": 42, "time": 9}"#).unwrap(), 42);
        assert!(matches!(
            parse_message_id("not json"),
            Err(BanterLinkError::Protocol(_))
        ));
        assert!(matches!(
            parse_message_id(r#"{"time": 9}"#),
            Err(BanterLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok("ok").is_ok());
        assert!(expect_ok("ok\n").is_ok());
        assert!(matches!(
            expect_ok("It is too late to edit this message"),
            Err(BanterLinkError::ActionRejected { status: 200, .. })
        ));
    }

    #[test]
    fn test_room_state_terminal_matching() {
        let closed = RoomState::Closed {
            reason: CloseReason::ConnectionLost { attempts: 8 },
        };
        assert!(matches!(closed, RoomState::Closed { .. }));
        assert_ne!(
            closed,
            RoomState::Closed {
                reason: CloseReason::Left
            }
        );
    }
}
