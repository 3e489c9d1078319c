// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    message::{framing::MessageDecoder, reader::MessageReader},
    pipe::error::PipeError,
};

/// Why the handler's read loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The loop has not stopped yet.
    #[default]
    None,
    /// `stop` was called (or the loop observed its cancel).
    StoppedLoop,
    /// The message callback asked to stop.
    ProcessMessage,
    /// The configured message budget was reached.
    MaxMessageNumber,
    /// The underlying reader completed.
    OnReaderComplete,
    /// An armed read timeout fired and the hook did not absorb it.
    ReadTimeout,
    /// An error escaped the hooks.
    UnhandledError,
}

/// Override points of the pull-to-push loop. Only `handle_message` is
/// mandatory; the `on_*` hooks decide whether the loop absorbs a failure
/// (`true`) or stops.
#[async_trait]
pub trait MessageHandlerHooks<M: Send>: Send {
    /// Handles one message; `None` is the reader's "no message" sentinel
    /// (delivered only with `handle_cancel_messages`). Returning `Ok(false)`
    /// stops the loop with [`StopReason::ProcessMessage`].
    async fn handle_message(
        &mut self,
        message: Option<M>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    fn on_read_loop_start(&mut self) {}

    fn on_read_loop_stop(&mut self, _reason: StopReason) {}

    /// An armed read timeout fired. `true` keeps the loop reading.
    fn on_read_timeout(&mut self) -> bool {
        false
    }

    /// The per-message handling timeout fired. `true` keeps the loop going.
    fn on_handling_message_timeout(&mut self) -> bool {
        false
    }

    /// Any other error escaped the read or the callback. `true` keeps the
    /// loop going.
    fn on_unhandled_exception(&mut self, _error: &anyhow::Error) -> bool {
        false
    }
}

/// Tuning for a [`MessageHandler`].
#[derive(Debug, Clone)]
pub struct MessageHandlerOptions {
    /// Idle-read timeout applied by default to each read cycle.
    pub default_read_timeout: Option<Duration>,
    /// Budget for one `handle_message` invocation.
    pub handling_timeout: Option<Duration>,
    /// Re-arm the default read timeout at the start of every cycle. When
    /// off, the caller re-arms through `set_read_timeout` as needed.
    pub auto_apply_timeout: bool,
    /// Deliver `None` sentinels to the callback instead of skipping them.
    pub handle_cancel_messages: bool,
}

impl Default for MessageHandlerOptions {
    fn default() -> Self {
        Self {
            default_read_timeout: None,
            handling_timeout: None,
            auto_apply_timeout: true,
            handle_cancel_messages: false,
        }
    }
}

/// Suspended marker for the active timeout.
const SUSPENDED: i64 = -1;
/// "Use the default" marker for the active timeout.
const USE_DEFAULT: i64 = 0;

/// Adapts the pull-based [`MessageReader`] to a push callback: a spawned
/// loop reads one message per cycle, applies the dynamically adjustable
/// idle-read timeout, and feeds the hooks until something stops it.
pub struct MessageHandler<D: MessageDecoder> {
    reader: Arc<MessageReader<D>>,
    running: AtomicBool,
    /// `> 0` explicit ms, `0` default, `< 0` suspended.
    active_timeout_ms: AtomicI64,
    default_read_timeout_ms: AtomicI64,
    handling_timeout_ms: AtomicI64,
    auto_apply_timeout: bool,
    handle_cancel_messages: bool,
    stop_tx: watch::Sender<StopReason>,
    run_cancel: Mutex<CancellationToken>,
}

impl<D> MessageHandler<D>
where
    D: MessageDecoder + 'static,
    D::Message: Send + 'static,
{
    pub fn new(reader: Arc<MessageReader<D>>, options: MessageHandlerOptions) -> Self {
        let (stop_tx, _) = watch::channel(StopReason::None);
        Self {
            reader,
            running: AtomicBool::new(false),
            active_timeout_ms: AtomicI64::new(SUSPENDED),
            default_read_timeout_ms: AtomicI64::new(
                options
                    .default_read_timeout
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(SUSPENDED),
            ),
            handling_timeout_ms: AtomicI64::new(
                options
                    .handling_timeout
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(SUSPENDED),
            ),
            auto_apply_timeout: options.auto_apply_timeout,
            handle_cancel_messages: options.handle_cancel_messages,
            stop_tx,
            run_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn reader(&self) -> &Arc<MessageReader<D>> {
        &self.reader
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Arms the idle-read timeout for the coming cycles: `0` means "use
    /// the default", a negative value suspends it.
    pub fn set_read_timeout(&self, millis: i64) {
        self.active_timeout_ms.store(millis, Ordering::SeqCst);
    }

    /// Clears the idle-read timeout. Called by the loop itself right after
    /// every received frame: the handling step is never bounded by the
    /// read timeout.
    pub fn suspend_read_timeout(&self) {
        self.active_timeout_ms.store(SUSPENDED, Ordering::SeqCst);
    }

    fn effective_read_timeout(&self) -> Option<Duration> {
        let active = self.active_timeout_ms.load(Ordering::SeqCst);
        let ms = match active {
            USE_DEFAULT => self.default_read_timeout_ms.load(Ordering::SeqCst),
            other => other,
        };
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    fn handling_timeout(&self) -> Option<Duration> {
        let ms = self.handling_timeout_ms.load(Ordering::SeqCst);
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    /// Observes every loop exit (one `StopReason` per run).
    pub fn stopped_reason(&self) -> watch::Receiver<StopReason> {
        self.stop_tx.subscribe()
    }

    /// Starts the loop; `false` when already running. `max_messages`
    /// bounds the number of handled messages. Takes an owned handle
    /// because the spawned loop outlives the call.
    pub fn start<H>(self: Arc<Self>, hooks: H, max_messages: Option<u64>) -> bool
    where H: MessageHandlerHooks<D::Message> + 'static {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let cancel = CancellationToken::new();
        *self.run_cancel.lock().expect("cancel lock poisoned") = cancel.clone();
        let this = self;
        tokio::spawn(async move {
            let reason = this.run_loop(hooks, max_messages, cancel).await;
            this.running.store(false, Ordering::SeqCst);
            let _ = this.stop_tx.send(reason);
        });
        true
    }

    /// Stops the loop; `false` when idle. With `cancel_pending_read` the
    /// blocked read is interrupted immediately.
    pub fn stop(&self, cancel_pending_read: bool) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.run_cancel
            .lock()
            .expect("cancel lock poisoned")
            .cancel();
        if cancel_pending_read {
            self.reader.cancel_pending_read();
        }
        true
    }

    async fn run_loop<H>(
        &self,
        mut hooks: H,
        max_messages: Option<u64>,
        cancel: CancellationToken,
    ) -> StopReason
    where
        H: MessageHandlerHooks<D::Message>,
    {
        hooks.on_read_loop_start();
        let mut handled: u64 = 0;
        let reason = loop {
            if cancel.is_cancelled() || !self.running.load(Ordering::SeqCst) {
                break StopReason::StoppedLoop;
            }
            if self.auto_apply_timeout {
                self.active_timeout_ms.store(USE_DEFAULT, Ordering::SeqCst);
            }
            let timeout = self.effective_read_timeout();

            let message = match self
                .reader
                .read_next_timeout(Some(&cancel), timeout)
                .await
            {
                Ok(message) => {
                    self.suspend_read_timeout();
                    message
                },
                Err(err) => {
                    self.suspend_read_timeout();
                    match err.downcast_ref::<PipeError>() {
                        Some(PipeError::MessageReadTimeout(_)) => {
                            if hooks.on_read_timeout() {
                                continue;
                            }
                            break StopReason::ReadTimeout;
                        },
                        Some(PipeError::Canceled) => break StopReason::StoppedLoop,
                        _ => {
                            warn!("message loop read failed: {err:#}");
                            if hooks.on_unhandled_exception(&err) {
                                continue;
                            }
                            break StopReason::UnhandledError;
                        },
                    }
                },
            };

            if message.is_none() {
                if self.reader.is_completed() {
                    break StopReason::OnReaderComplete;
                }
                if !self.handle_cancel_messages
                    || !self.running.load(Ordering::SeqCst)
                {
                    continue;
                }
            }

            let outcome = match self.handling_timeout() {
                Some(dur) => {
                    let handling_cancel = cancel.child_token();
                    tokio::select! {
                        r = hooks.handle_message(message, &handling_cancel) => r,
                        _ = tokio::time::sleep(dur) => {
                            handling_cancel.cancel();
                            debug!("handling a message exceeded {dur:?}");
                            Ok(hooks.on_handling_message_timeout())
                        },
                    }
                },
                None => hooks.handle_message(message, &cancel).await,
            };
            match outcome {
                Ok(true) => {},
                Ok(false) => break StopReason::ProcessMessage,
                Err(err) => {
                    warn!("message callback failed: {err:#}");
                    if !hooks.on_unhandled_exception(&err) {
                        break StopReason::UnhandledError;
                    }
                },
            }

            handled += 1;
            if max_messages.is_some_and(|max| handled >= max) {
                break StopReason::MaxMessageNumber;
            }
        };
        hooks.on_read_loop_stop(reason);
        reason
    }
}
