// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    message::framing::{DecodeOutcome, MessageDecoder},
    pipe::{behavior::ErrorAction, error::PipeError, stable_reader::StableReader},
    utils::dump_bytes,
};

const IDLE: u8 = 0;
const READING: u8 = 1;
const CANCEL_ARMED: u8 = 2;

/// Pull-based framed reader over a [`StableReader`].
///
/// `read_next` isolates exactly one frame per call and returns `None` (the
/// "no message" sentinel) when the reader is completed, when the underlying
/// read was canceled, or when an armed pending cancel was consumed. An
/// empty frame is a valid message, distinct from the sentinel.
pub struct MessageReader<D: MessageDecoder> {
    inner: Arc<StableReader>,
    decoder: Mutex<D>,
    receiving: AtomicU8,
    completed: AtomicBool,
    /// Milliseconds; `<= 0` disables the default receive timeout.
    default_receive_timeout_ms: AtomicI64,
    log_tag: Option<String>,
}

impl<D: MessageDecoder> MessageReader<D> {
    pub fn new(inner: Arc<StableReader>, decoder: D) -> Self {
        Self {
            inner,
            decoder: Mutex::new(decoder),
            receiving: AtomicU8::new(IDLE),
            completed: AtomicBool::new(false),
            default_receive_timeout_ms: AtomicI64::new(-1),
            log_tag: None,
        }
    }

    /// Enables a hex/ASCII dump of every received frame under this tag.
    pub fn with_log_tag(mut self, tag: impl Into<String>) -> Self {
        self.log_tag = Some(tag.into());
        self
    }

    pub fn set_default_receive_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map(|d| d.as_millis() as i64).unwrap_or(-1);
        self.default_receive_timeout_ms.store(ms, Ordering::SeqCst);
    }

    fn default_receive_timeout(&self) -> Option<Duration> {
        let ms = self.default_receive_timeout_ms.load(Ordering::SeqCst);
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst) || self.inner.is_completed()
    }

    pub fn stable_reader(&self) -> &Arc<StableReader> {
        &self.inner
    }

    /// If a read is in flight, forwards the cancel to the stable reader so
    /// it returns a canceled result; when idle, arms a pending cancel that
    /// makes exactly one future `read_next` return `None`.
    pub fn cancel_pending_read(&self) {
        loop {
            match self.receiving.load(Ordering::SeqCst) {
                READING => {
                    self.inner.cancel_pending_read();
                    return;
                },
                CANCEL_ARMED => return,
                _ => {
                    if self
                        .receiving
                        .compare_exchange(
                            IDLE,
                            CANCEL_ARMED,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        return;
                    }
                },
            }
        }
    }

    /// Reads the next message with the default receive timeout.
    pub async fn read_next(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<D::Message>> {
        self.read_next_filtered(cancel, None, |_| true).await
    }

    /// Reads the next message with an explicit timeout (`None` falls back
    /// to the default receive timeout).
    pub async fn read_next_timeout(
        &self,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<Option<D::Message>> {
        self.read_next_filtered(cancel, timeout, |_| true).await
    }

    /// Reads the next message admitted by `filter`; rejected messages are
    /// consumed and skipped.
    pub async fn read_next_filtered(
        &self,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
        filter: impl Fn(&D::Message) -> bool,
    ) -> Result<Option<D::Message>> {
        if self.is_completed() {
            return Ok(None);
        }
        loop {
            match self.receiving.compare_exchange(
                IDLE,
                READING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(CANCEL_ARMED) => {
                    if self
                        .receiving
                        .compare_exchange(
                            CANCEL_ARMED,
                            IDLE,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        // The armed cancel is consumed by exactly one call.
                        return Ok(None);
                    }
                },
                Err(_) => return Err(PipeError::AlreadyReading.into()),
            }
        }
        let guard = ReceivingGuard {
            flag: &self.receiving,
        };
        let out = self.read_loop(cancel, timeout, filter).await;
        drop(guard);
        out
    }

    async fn read_loop(
        &self,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
        filter: impl Fn(&D::Message) -> bool,
    ) -> Result<Option<D::Message>> {
        let timeout = timeout.or_else(|| self.default_receive_timeout());
        loop {
            let read_res = match timeout {
                // The framed-operation timeout owns the inner read: the
                // stable reader delegates (it sees a cancellable token)
                // and the deadline fires here.
                Some(dur) => {
                    let token = cancel
                        .map(|c| c.child_token())
                        .unwrap_or_default();
                    tokio::select! {
                        r = self.inner.read_async(Some(&token)) => r,
                        _ = tokio::time::sleep(dur) => {
                            Err(PipeError::MessageReadTimeout(dur))
                        },
                    }
                },
                None => self.inner.read_async(cancel).await,
            };

            let result = match read_res {
                Ok(result) => result,
                Err(err @ PipeError::MessageReadTimeout(_)) => {
                    match self.inner.behavior().on_error(&err) {
                        ErrorAction::Retry => continue,
                        ErrorAction::Cancel => return Ok(None),
                        ErrorAction::Throw => return Err(err.into()),
                    }
                },
                Err(err) => return Err(err.into()),
            };

            let outcome = {
                let mut decoder = self.decoder.lock().expect("decoder lock poisoned");
                decoder.try_decode(&result.buffer)
            };
            match outcome {
                DecodeOutcome::Frame { frame, consumed } => {
                    self.inner.advance_to(consumed, consumed)?;
                    if let Some(tag) = &self.log_tag {
                        debug!("[{tag}] recv: {}", dump_bytes(&frame));
                    }
                    if result.is_completed {
                        self.completed.store(true, Ordering::SeqCst);
                    }
                    let message = {
                        let mut decoder =
                            self.decoder.lock().expect("decoder lock poisoned");
                        decoder.convert(frame)?
                    };
                    if !filter(&message) {
                        if result.is_completed {
                            return Ok(None);
                        }
                        continue;
                    }
                    return Ok(Some(message));
                },
                DecodeOutcome::NeedMore { consumed } => {
                    self.inner.advance_to(consumed, result.buffer.len())?;
                    if result.is_completed {
                        self.completed.store(true, Ordering::SeqCst);
                        return Ok(None);
                    }
                    if result.is_canceled {
                        return Ok(None);
                    }
                },
            }
        }
    }
}

/// Restores the idle state even when the read future is dropped mid-await.
struct ReceivingGuard<'a> {
    flag: &'a AtomicU8,
}

impl Drop for ReceivingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(IDLE, Ordering::SeqCst);
    }
}
