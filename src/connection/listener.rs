//! Per-room listener task.
//!
//! Owns the ticket → connect → read-loop cycle for one room. Decoded events
//! are forwarded in sequence order to the dispatcher channel; silently dead
//! connections are detected with an idle ping/pong check; failures feed a
//! bounded reconnect loop with exponential backoff. The task is the only
//! writer of the room's state channel.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::connection::websocket::{
    connect_stream, fetch_ticket, reconnect_delay, WebSocketStream,
};
use crate::connection::{DEDUP_WINDOW_CAPACITY, FAR_FUTURE, MAX_FRAME_BYTES};
use crate::credentials::Session;
use crate::error::{BanterLinkError, Result};
use crate::models::{parse_frame, Event, ReconnectOptions};
use crate::room::{CloseReason, RoomState};
use crate::scrape::ArcMarkupAdapter;
use crate::timeouts::BanterLinkTimeouts;

/// Everything the listener task needs, wired up by `Room::join`.
pub(crate) struct ListenerContext {
    pub session: Session,
    pub room_id: u64,
    /// Room-scoped fkey, shared with the command queue; replaced in place
    /// when the platform rotates it.
    pub fkey: Arc<RwLock<String>>,
    pub markup: ArcMarkupAdapter,
    pub timeouts: BanterLinkTimeouts,
    pub reconnect: ReconnectOptions,
    pub events_tx: mpsc::Sender<Event>,
    pub state_tx: watch::Sender<RoomState>,
}

impl ListenerContext {
    fn set_state(&self, state: RoomState) {
        self.state_tx.send_replace(state);
    }
}

/// Remembers recently delivered sequence ids so a backlog replayed after a
/// reconnect is dropped instead of redelivered.
pub(crate) struct DedupWindow {
    seen: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `true` when `id` was not seen before (and records it).
    pub fn insert(&mut self, id: u64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Re-scrape the room page for a rotated fkey and publish it to the shared
/// slot.
async fn refresh_room_fkey(ctx: &ListenerContext) -> Result<()> {
    let response = ctx
        .session
        .http
        .get(ctx.session.server.chat_url(&format!("/rooms/{}", ctx.room_id)))
        .send()
        .await?;
    let page = response.text().await?;
    let fkey = ctx.markup.room_fkey(&page).ok_or_else(|| {
        BanterLinkError::Protocol("room page did not contain an fkey token".to_string())
    })?;
    log::info!("[banter-link] [r{}] room fkey refreshed", ctx.room_id);
    *ctx.fkey.write().unwrap_or_else(|e| e.into_inner()) = fkey;
    Ok(())
}

/// Fetch a fresh ticket and open the stream.
///
/// A rejected handshake usually means the room fkey rotated; the fkey is
/// re-scraped once and the handshake retried before giving up.
async fn establish(ctx: &ListenerContext, resume: Option<u64>) -> Result<WebSocketStream> {
    let fkey = ctx.fkey.read().unwrap_or_else(|e| e.into_inner()).clone();
    let ticket = match fetch_ticket(&ctx.session, ctx.room_id, &fkey, resume).await {
        Ok(ticket) => ticket,
        Err(BanterLinkError::ActionRejected { status, .. }) => {
            log::info!(
                "[banter-link] [r{}] ticket handshake rejected ({status}), refreshing fkey",
                ctx.room_id
            );
            refresh_room_fkey(ctx).await?;
            let fkey = ctx.fkey.read().unwrap_or_else(|e| e.into_inner()).clone();
            fetch_ticket(&ctx.session, ctx.room_id, &fkey, resume)
                .await
                .map_err(|e| match e {
                    BanterLinkError::ActionRejected { status, message } => {
                        BanterLinkError::WebSocket(format!(
                            "ticket handshake rejected after fkey refresh ({status}): {message}"
                        ))
                    }
                    other => other,
                })?
        }
        Err(e) => return Err(e),
    };
    log::debug!("[banter-link] [r{}] connecting stream", ctx.room_id);
    connect_stream(&ctx.session, &ticket, ctx.timeouts.handshake).await
}

/// Why the read loop gave its stream up.
enum ReadOutcome {
    /// `leave()` asked us to stop.
    Closed,
    /// The dispatcher is gone; the room is being torn down.
    ReceiverGone,
    /// Socket died or was cycled; reconnect.
    Reconnect,
}

/// Read frames until the stream dies, the room closes, or the socket is due
/// for its periodic cycle.
async fn read_loop(
    ctx: &ListenerContext,
    stream: &mut WebSocketStream,
    close_rx: &mut oneshot::Receiver<()>,
    dedup: &mut DedupWindow,
    watermark: &mut Option<u64>,
) -> ReadOutcome {
    let room_id = ctx.room_id;
    let connected_at = TokioInstant::now();
    let reset_deadline = if ctx.timeouts.socket_reset.is_zero() {
        connected_at + FAR_FUTURE
    } else {
        connected_at + ctx.timeouts.socket_reset
    };

    let mut idle_deadline = TokioInstant::now() + ctx.timeouts.read_idle;
    let mut awaiting_pong = false;
    let mut pong_deadline = TokioInstant::now() + FAR_FUTURE;

    loop {
        let idle_sleep = tokio::time::sleep_until(idle_deadline);
        tokio::pin!(idle_sleep);
        let pong_sleep = tokio::time::sleep_until(pong_deadline);
        tokio::pin!(pong_sleep);
        let reset_sleep = tokio::time::sleep_until(reset_deadline);
        tokio::pin!(reset_sleep);

        tokio::select! {
            biased;

            _ = &mut *close_rx => {
                let _ = stream.close(None).await;
                return ReadOutcome::Closed;
            }

            _ = &mut pong_sleep, if awaiting_pong => {
                log::warn!(
                    "[banter-link] [r{room_id}] no pong within {:?}, connection is dead",
                    ctx.timeouts.pong
                );
                return ReadOutcome::Reconnect;
            }

            _ = &mut reset_sleep => {
                log::info!("[banter-link] [r{room_id}] cycling socket after reset interval");
                let _ = stream.close(None).await;
                return ReadOutcome::Reconnect;
            }

            _ = &mut idle_sleep, if !awaiting_pong => {
                log::debug!("[banter-link] [r{room_id}] stream idle, sending keepalive ping");
                if let Err(e) = stream.send(Message::Ping(Bytes::new())).await {
                    log::warn!("[banter-link] [r{room_id}] keepalive ping failed: {e}");
                    return ReadOutcome::Reconnect;
                }
                awaiting_pong = true;
                pong_deadline = TokioInstant::now() + ctx.timeouts.pong;
                idle_deadline = TokioInstant::now() + ctx.timeouts.read_idle;
            }

            frame = stream.next() => {
                // any frame proves the connection is alive
                idle_deadline = TokioInstant::now() + ctx.timeouts.read_idle;
                if awaiting_pong {
                    awaiting_pong = false;
                    pong_deadline = TokioInstant::now() + FAR_FUTURE;
                }

                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_FRAME_BYTES {
                            log::warn!(
                                "[banter-link] [r{room_id}] dropping oversized frame ({} bytes)",
                                text.len()
                            );
                            continue;
                        }
                        match parse_frame(&text, room_id) {
                            Ok(batch) => {
                                if let Some(t) = batch.watermark {
                                    *watermark = Some(t);
                                }
                                for event in batch.events {
                                    if !dedup.insert(event.id()) {
                                        log::debug!(
                                            "[banter-link] [r{room_id}] dropping replayed event {}",
                                            event.id()
                                        );
                                        continue;
                                    }
                                    if ctx.events_tx.send(event).await.is_err() {
                                        return ReadOutcome::ReceiverGone;
                                    }
                                }
                            }
                            Err(e) => {
                                // single bad frame; the stream continues
                                log::warn!(
                                    "[banter-link] [r{room_id}] skipping undecodable frame: {e}"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::warn!(
                            "[banter-link] [r{room_id}] ignoring unexpected binary frame ({} bytes)",
                            data.len()
                        );
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = stream.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        log::debug!("[banter-link] [r{room_id}] keepalive pong received");
                    }
                    Some(Ok(Message::Close(_))) => {
                        log::info!("[banter-link] [r{room_id}] stream closed by the platform");
                        return ReadOutcome::Reconnect;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        log::warn!("[banter-link] [r{room_id}] stream read error: {e}");
                        return ReadOutcome::Reconnect;
                    }
                    None => {
                        log::info!("[banter-link] [r{room_id}] stream ended");
                        return ReadOutcome::Reconnect;
                    }
                }
            }
        }
    }
}

/// Long-running listener task for one room.
///
/// `ready_tx` resolves once the initial connection attempt settles; `Room::join`
/// fails if it settles with an error. Afterwards the task reconnects on its
/// own with bounded backoff and only closes the room when the bound is
/// exhausted or `close_rx` fires.
pub(crate) async fn listener_task(
    ctx: ListenerContext,
    mut close_rx: oneshot::Receiver<()>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let room_id = ctx.room_id;
    let mut dedup = DedupWindow::new(DEDUP_WINDOW_CAPACITY);
    let mut watermark: Option<u64> = None;

    let mut stream = match establish(&ctx, watermark).await {
        Ok(stream) => {
            ctx.set_state(RoomState::Connected);
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    log::info!("[banter-link] [r{room_id}] connected to event stream");

    loop {
        match read_loop(&ctx, &mut stream, &mut close_rx, &mut dedup, &mut watermark).await {
            ReadOutcome::Closed | ReadOutcome::ReceiverGone => {
                ctx.set_state(RoomState::Closed {
                    reason: CloseReason::Left,
                });
                return;
            }
            ReadOutcome::Reconnect => {}
        }

        ctx.set_state(RoomState::Reconnecting);
        let mut attempt: u32 = 0;
        stream = loop {
            attempt += 1;
            if attempt > ctx.reconnect.max_attempts {
                log::warn!(
                    "[banter-link] [r{room_id}] giving up after {} reconnect attempts",
                    ctx.reconnect.max_attempts
                );
                ctx.set_state(RoomState::Closed {
                    reason: CloseReason::ConnectionLost {
                        attempts: ctx.reconnect.max_attempts,
                    },
                });
                return;
            }

            let delay = reconnect_delay(
                ctx.reconnect.initial_delay,
                ctx.reconnect.max_delay,
                attempt,
            );
            log::info!(
                "[banter-link] [r{room_id}] reconnecting in {delay:?} (attempt {attempt}/{})",
                ctx.reconnect.max_attempts
            );
            let closed = tokio::select! {
                biased;
                _ = &mut close_rx => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if closed {
                ctx.set_state(RoomState::Closed {
                    reason: CloseReason::Left,
                });
                return;
            }

            match establish(&ctx, watermark).await {
                Ok(stream) => {
                    log::info!("[banter-link] [r{room_id}] reconnected");
                    ctx.set_state(RoomState::Connected);
                    break stream;
                }
                Err(e) => {
                    log::warn!(
                        "[banter-link] [r{room_id}] reconnect attempt {attempt} failed: {e}"
                    );
                }
            }
        };
    }
}
