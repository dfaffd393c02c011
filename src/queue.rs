//! Outgoing command queue: one room, one request in flight.
//!
//! Every state-changing action goes through a per-room background task that
//! executes commands strictly serially, enforces a minimum inter-request
//! interval, and retries transient failures with exponential backoff and
//! jitter. Different rooms run their queues concurrently; within a room,
//! commands complete in the order they were enqueued.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::credentials::Session;
use crate::error::{BanterLinkError, Result};
use crate::models::QueueOptions;

/// Capacity of the pending-command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Whether a command may be blindly re-sent after an ambiguous failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Idempotency {
    /// Safe to retry even when the previous attempt may have reached the
    /// platform (star, pin, bookmark, ack).
    Idempotent,
    /// Retrying after an ambiguous failure could duplicate the action
    /// (send, edit, delete, move).
    NonIdempotent,
}

/// One queued action against the platform.
pub(crate) struct Command {
    /// Chat-host route, e.g. `/messages/42/star`.
    pub route: String,
    /// Form parameters; the room fkey is appended at send time so retries
    /// pick up a rotated token.
    pub params: Vec<(String, String)>,
    pub idempotency: Idempotency,
    /// Responder for the platform's raw body. `None` for fire-and-forget
    /// commands; a dropped receiver is tolerated either way.
    pub respond: Option<oneshot::Sender<Result<String>>>,
}

impl Command {
    fn finish(self, result: Result<String>) {
        if let Some(respond) = self.respond {
            let _ = respond.send(result);
        }
    }
}

/// Cloneable handle to a room's command queue task.
#[derive(Clone)]
pub(crate) struct CommandQueue {
    cmd_tx: mpsc::Sender<Command>,
}

impl CommandQueue {
    /// Spawn the queue task for one room. Returns the handle, the shutdown
    /// signal, and the task handle (awaited on leave).
    pub fn spawn(
        session: Session,
        fkey: Arc<RwLock<String>>,
        options: QueueOptions,
    ) -> (Self, watch::Sender<bool>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(queue_task(session, fkey, options, cmd_rx, shutdown_rx));
        (Self { cmd_tx }, shutdown_tx, task)
    }

    /// Enqueue a command and wait for its terminal result.
    pub async fn submit(
        &self,
        route: String,
        params: Vec<(String, String)>,
        idempotency: Idempotency,
    ) -> Result<String> {
        let (respond, result_rx) = oneshot::channel();
        let command = Command {
            route,
            params,
            idempotency,
            respond: Some(respond),
        };
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| BanterLinkError::Cancelled)?;
        result_rx.await.map_err(|_| BanterLinkError::Cancelled)?
    }

    /// Enqueue an idempotent command without waiting for the result. Used
    /// for background acknowledgements; a full or closed queue drops it.
    pub fn submit_nowait(&self, route: String, params: Vec<(String, String)>) {
        let command = Command {
            route,
            params,
            idempotency: Idempotency::Idempotent,
            respond: None,
        };
        if self.cmd_tx.try_send(command).is_err() {
            log::debug!("[banter-link] dropping fire-and-forget command, queue unavailable");
        }
    }

    /// A handle whose task is already gone; submissions fail with
    /// [`BanterLinkError::Cancelled`].
    #[cfg(test)]
    pub fn disconnected() -> Self {
        let (cmd_tx, _) = mpsc::channel(1);
        Self { cmd_tx }
    }
}

/// The platform's rate-limit responses name the wait in the body.
fn rate_limit_delay(body: &str, fallback: Duration) -> Duration {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"You can perform this action again in (\d+) seconds?")
            .expect("valid rate limit pattern")
    });
    pattern
        .captures(body)
        .and_then(|caps| caps[1].parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

/// Exponential backoff delay for the given attempt (1-based), without jitter.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

/// Add up to +50% random jitter so parallel rooms do not retry in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let extra_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
    delay + Duration::from_millis(extra_ms)
}

/// How a failed attempt relates to the platform having seen the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    /// The platform answered with a definite failure; the action was not
    /// performed. Retryable for every command.
    DefiniteFailure,
    /// The request never left this host (connection refused). Retryable for
    /// every command.
    PreSend,
    /// The request may have reached the platform (timeout, mid-stream
    /// error). Retryable only for idempotent commands.
    Ambiguous,
}

struct QueueState {
    min_interval: Duration,
    max_min_interval: Duration,
}

impl QueueState {
    /// A rate-limit response means the current pace is too fast; double the
    /// floor, bounded.
    fn raise_min_interval(&mut self) {
        let raised = self
            .min_interval
            .saturating_mul(2)
            .min(self.max_min_interval);
        if raised > self.min_interval {
            log::info!(
                "[banter-link] raising command interval to {:?} after rate limit",
                raised
            );
            self.min_interval = raised;
        }
    }
}

async fn queue_task(
    session: Session,
    fkey: Arc<RwLock<String>>,
    options: QueueOptions,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut state = QueueState {
        min_interval: options.min_interval,
        max_min_interval: options.max_min_interval,
    };
    let mut next_allowed = Instant::now();

    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => return,
            },
        };
        let Command {
            route,
            params,
            idempotency,
            respond,
        } = command;

        // Rate-limit gate; the command has not started, so shutdown here
        // always cancels it.
        let cancelled = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => true,
            _ = tokio::time::sleep_until(next_allowed) => false,
        };
        if cancelled {
            send_result(respond, Err(BanterLinkError::Cancelled));
            break;
        }

        next_allowed = Instant::now() + state.min_interval;

        if options.drain_on_close {
            let result =
                execute_command(&session, &fkey, &options, &mut state, &route, &params, idempotency)
                    .await;
            send_result(respond, result);
        } else {
            let execution =
                execute_command(&session, &fkey, &options, &mut state, &route, &params, idempotency);
            tokio::pin!(execution);
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    send_result(respond, Err(BanterLinkError::Cancelled));
                    break;
                }
                result = &mut execution => send_result(respond, result),
            }
        }
    }

    // Shutdown: everything still queued was never started; cancel it.
    cmd_rx.close();
    while let Ok(command) = cmd_rx.try_recv() {
        command.finish(Err(BanterLinkError::Cancelled));
    }
    log::debug!("[banter-link] command queue stopped");
}

fn send_result(respond: Option<oneshot::Sender<Result<String>>>, result: Result<String>) {
    if let Some(respond) = respond {
        let _ = respond.send(result);
    }
}

/// Execute one command to a terminal result, applying the retry policy.
#[allow(clippy::too_many_arguments)]
async fn execute_command(
    session: &Session,
    fkey: &RwLock<String>,
    options: &QueueOptions,
    state: &mut QueueState,
    route: &str,
    params: &[(String, String)],
    idempotency: Idempotency,
) -> Result<String> {
    let url = session.server.chat_url(route);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        // re-read per attempt: the room fkey may rotate under us
        let current_fkey = fkey.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut form = params.to_vec();
        form.push(("fkey".to_string(), current_fkey));

        log::debug!(
            "[banter-link] POST {route} (attempt {}/{})",
            attempt,
            options.max_attempts
        );

        let (failure, class, wait) = match session.http.post(&url).form(&form).send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status.is_success() {
                    return Ok(body);
                }
                if status.as_u16() == 409 {
                    let retry_after = rate_limit_delay(&body, options.rate_limit_fallback);
                    state.raise_min_interval();
                    (
                        BanterLinkError::RateLimited { retry_after },
                        FailureClass::DefiniteFailure,
                        Some(retry_after),
                    )
                } else if status.is_server_error() {
                    (
                        BanterLinkError::TransientNetwork(format!(
                            "platform answered {status} for {route}"
                        )),
                        FailureClass::DefiniteFailure,
                        None,
                    )
                } else {
                    return Err(BanterLinkError::ActionRejected {
                        status: status.as_u16(),
                        message: body,
                    });
                }
            }
            Err(e) if e.is_connect() => (
                BanterLinkError::TransientNetwork(e.to_string()),
                FailureClass::PreSend,
                None,
            ),
            Err(e) if e.is_timeout() => (
                BanterLinkError::Timeout(e.to_string()),
                FailureClass::Ambiguous,
                None,
            ),
            Err(e) => (
                BanterLinkError::TransientNetwork(e.to_string()),
                FailureClass::Ambiguous,
                None,
            ),
        };

        let retry_safe =
            class != FailureClass::Ambiguous || idempotency == Idempotency::Idempotent;
        if attempt >= options.max_attempts || !retry_safe {
            if !retry_safe {
                log::warn!(
                    "[banter-link] not retrying {route} after ambiguous failure: {failure}"
                );
            }
            return Err(failure);
        }

        let delay = match wait {
            Some(platform_delay) => platform_delay,
            None => with_jitter(backoff_delay(
                options.backoff_base,
                options.backoff_cap,
                attempt,
            )),
        };
        log::debug!("[banter-link] retrying {route} in {delay:?} after: {failure}");
        tokio::time::sleep(delay).await;
    }
}
