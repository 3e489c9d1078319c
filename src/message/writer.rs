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
use bytes::BytesMut;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    message::framing::MessageEncoder,
    pipe::{behavior::ErrorAction, error::PipeError, stable_writer::StableWriter},
    utils::dump_bytes,
};

/// Push-based framed writer over a [`StableWriter`]: one frame formatted
/// and flushed per `write` call.
///
/// By default concurrent writes fail with [`PipeError::AlreadyWriting`];
/// with `multiple_writers` enabled an internal lock serializes them,
/// honoring the caller's cancel/timeout while waiting.
pub struct MessageWriter<E: MessageEncoder> {
    inner: Arc<StableWriter>,
    encoder: Mutex<E>,
    writing: AtomicBool,
    serialize_writers: Option<tokio::sync::Mutex<()>>,
    /// Milliseconds; `<= 0` disables the default send timeout.
    default_send_timeout_ms: AtomicI64,
    last_sent: Mutex<Option<Instant>>,
    log_tag: Option<String>,
}

impl<E: MessageEncoder> MessageWriter<E> {
    pub fn new(inner: Arc<StableWriter>, encoder: E) -> Self {
        Self::with_options(inner, encoder, false)
    }

    /// `multiple_writers` serializes concurrent writers instead of failing
    /// the second one.
    pub fn with_options(
        inner: Arc<StableWriter>,
        encoder: E,
        multiple_writers: bool,
    ) -> Self {
        Self {
            inner,
            encoder: Mutex::new(encoder),
            writing: AtomicBool::new(false),
            serialize_writers: multiple_writers.then(|| tokio::sync::Mutex::new(())),
            default_send_timeout_ms: AtomicI64::new(-1),
            last_sent: Mutex::new(None),
            log_tag: None,
        }
    }

    /// Enables a hex/ASCII dump of every sent frame under this tag.
    pub fn with_log_tag(mut self, tag: impl Into<String>) -> Self {
        self.log_tag = Some(tag.into());
        self
    }

    pub fn set_default_send_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map(|d| d.as_millis() as i64).unwrap_or(-1);
        self.default_send_timeout_ms.store(ms, Ordering::SeqCst);
    }

    fn default_send_timeout(&self) -> Option<Duration> {
        let ms = self.default_send_timeout_ms.load(Ordering::SeqCst);
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    pub fn stable_writer(&self) -> &Arc<StableWriter> {
        &self.inner
    }

    /// Time since the last successfully flushed frame.
    pub fn last_send_elapsed(&self) -> Option<Duration> {
        self.last_sent
            .lock()
            .expect("last-sent lock poisoned")
            .map(|t| t.elapsed())
    }

    /// Writes one framed message with the default send timeout.
    ///
    /// Returns `false` when the writer is completed or the frame formatter
    /// aborted; `true` once the frame was handed to the transport.
    pub async fn write(
        &self,
        message: &E::Message,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        self.write_timeout(message, cancel, None).await
    }

    /// Writes one framed message with an explicit timeout (`None` falls
    /// back to the default send timeout).
    pub async fn write_timeout(
        &self,
        message: &E::Message,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        if self.inner.is_completed() {
            return Ok(false);
        }
        let timeout = timeout.or_else(|| self.default_send_timeout());
        let mut encoded = false;

        // Behavior-driven retries re-acquire the write lock from the top;
        // the already-formatted frame stays in the stable writer's buffer.
        loop {
            let _guard = self.acquire(cancel, timeout).await?;
            if self.inner.is_completed() {
                return Ok(false);
            }

            if !encoded {
                // Formatting errors propagate unchanged: they are the
                // caller's bug, not communication failures.
                if !self.encode_frame(message)? {
                    return Ok(false);
                }
                encoded = true;
            }

            let flush_res = match timeout {
                Some(dur) => {
                    let token = cancel
                        .map(|c| c.child_token())
                        .unwrap_or_default();
                    tokio::select! {
                        r = self.inner.flush_async(Some(&token)) => r,
                        _ = tokio::time::sleep(dur) => {
                            Err(PipeError::MessageWriteTimeout(dur))
                        },
                    }
                },
                None => self.inner.flush_async(cancel).await,
            };

            match flush_res {
                Ok(result) => {
                    *self.last_sent.lock().expect("last-sent lock poisoned") =
                        Some(Instant::now());
                    return Ok(!result.is_completed);
                },
                Err(err @ PipeError::MessageWriteTimeout(_)) => {
                    match self.inner.behavior().on_error(&err) {
                        ErrorAction::Retry => continue,
                        ErrorAction::Cancel => {
                            return Ok(!self.inner.is_completed());
                        },
                        ErrorAction::Throw => return Err(err.into()),
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Formats one frame into the stable writer's pending buffer. With a
    /// log tag the frame is formatted to a scratch buffer first so the
    /// dump shows exactly what goes on the wire.
    fn encode_frame(&self, message: &E::Message) -> Result<bool> {
        let mut encoder = self.encoder.lock().expect("encoder lock poisoned");
        if let Some(tag) = &self.log_tag {
            let mut scratch = BytesMut::new();
            if !encoder.encode(message, &mut scratch)? {
                return Ok(false);
            }
            debug!("[{tag}] send: {}", dump_bytes(&scratch));
            self.inner.write_bytes(&scratch);
            return Ok(true);
        }
        match self.inner.with_buffer(|buf| {
            let start = buf.len();
            match encoder.encode(message, buf) {
                Ok(true) => Ok(true),
                Ok(false) => {
                    buf.truncate(start);
                    Ok(false)
                },
                Err(err) => {
                    buf.truncate(start);
                    Err(err)
                },
            }
        }) {
            // Completed while formatting.
            None => Ok(false),
            Some(out) => out,
        }
    }

    async fn acquire(
        &self,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<WriteGuard<'_>> {
        match &self.serialize_writers {
            None => {
                if self.writing.swap(true, Ordering::SeqCst) {
                    return Err(PipeError::AlreadyWriting.into());
                }
                Ok(WriteGuard::Flag(&self.writing))
            },
            Some(lock) => {
                let caller = cancel.cloned().unwrap_or_default();
                let permit = match timeout {
                    Some(dur) => tokio::select! {
                        permit = lock.lock() => permit,
                        _ = caller.cancelled() => {
                            return Err(PipeError::Canceled.into());
                        },
                        _ = tokio::time::sleep(dur) => {
                            return Err(PipeError::MessageWriteTimeout(dur).into());
                        },
                    },
                    None => tokio::select! {
                        permit = lock.lock() => permit,
                        _ = caller.cancelled() => {
                            return Err(PipeError::Canceled.into());
                        },
                    },
                };
                Ok(WriteGuard::Permit(permit))
            },
        }
    }
}

enum WriteGuard<'a> {
    Flag(&'a AtomicBool),
    #[allow(dead_code)]
    Permit(tokio::sync::MutexGuard<'a, ()>),
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let WriteGuard::Flag(flag) = self {
            flag.store(false, Ordering::SeqCst);
        }
    }
}
