// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::pipe::{
    byte_pipe::{ByteSink, ByteSource},
    error::PipeError,
    result::{FlushResult, ReadResult},
};

const READ_CHUNK: usize = 8 * 1024;

/// Staged bytes pulled from the underlying stream but not yet consumed by
/// the framing layer, plus the examined watermark.
#[derive(Debug, Default)]
struct Staged {
    buf: BytesMut,
    examined: usize,
}

impl Staged {
    fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }
}

/// [`ByteSource`] over any tokio `AsyncRead` (TCP halves in practice).
///
/// Bytes are staged in an internal buffer and served as snapshots; the
/// framing layer reports consumption back through `advance_to`, so a
/// partial frame survives until its tail arrives.
pub struct StreamSource<R> {
    io: tokio::sync::Mutex<R>,
    staged: std::sync::Mutex<Staged>,
    pending_cancel: std::sync::Mutex<CancellationToken>,
    completed: CancellationToken,
}

impl<R> StreamSource<R> {
    pub fn new(io: R) -> Self {
        Self {
            io: tokio::sync::Mutex::new(io),
            staged: std::sync::Mutex::new(Staged::default()),
            pending_cancel: std::sync::Mutex::new(CancellationToken::new()),
            completed: CancellationToken::new(),
        }
    }

    fn snapshot(&self) -> Bytes {
        self.staged.lock().expect("staged lock poisoned").snapshot()
    }

    fn take_pending_cancel(&self) -> CancellationToken {
        self.pending_cancel
            .lock()
            .expect("cancel lock poisoned")
            .clone()
    }

    fn rearm_pending_cancel(&self) {
        *self.pending_cancel.lock().expect("cancel lock poisoned") =
            CancellationToken::new();
    }
}

#[async_trait]
impl<R> ByteSource for StreamSource<R>
where R: AsyncRead + Unpin + Send
{
    async fn read(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReadResult, PipeError> {
        let caller = cancel.cloned().unwrap_or_default();
        let pending = self.take_pending_cancel();

        let mut io = self.io.lock().await;
        loop {
            if self.completed.is_cancelled() {
                return Ok(ReadResult::completed(self.snapshot()));
            }
            {
                let staged = self.staged.lock().expect("staged lock poisoned");
                if staged.buf.len() > staged.examined {
                    return Ok(ReadResult::data(staged.snapshot()));
                }
            }

            let mut chunk = BytesMut::with_capacity(READ_CHUNK);
            tokio::select! {
                _ = self.completed.cancelled() => {
                    return Ok(ReadResult::completed(self.snapshot()));
                },
                _ = pending.cancelled() => {
                    self.rearm_pending_cancel();
                    return Ok(ReadResult::canceled(self.snapshot()));
                },
                _ = caller.cancelled() => return Err(PipeError::Canceled),
                res = io.read_buf(&mut chunk) => match res {
                    Ok(0) => {
                        self.completed.cancel();
                        return Ok(ReadResult::completed(self.snapshot()));
                    },
                    Ok(_) => {
                        self.staged
                            .lock()
                            .expect("staged lock poisoned")
                            .buf
                            .extend_from_slice(&chunk);
                    },
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    fn try_read(&self) -> Result<Option<ReadResult>, PipeError> {
        let staged = self.staged.lock().expect("staged lock poisoned");
        if self.completed.is_cancelled() {
            return Ok(Some(ReadResult::completed(staged.snapshot())));
        }
        if staged.buf.len() > staged.examined {
            return Ok(Some(ReadResult::data(staged.snapshot())));
        }
        Ok(None)
    }

    fn advance_to(&self, consumed: usize, examined: usize) -> Result<(), PipeError> {
        let mut staged = self.staged.lock().expect("staged lock poisoned");
        if consumed > staged.buf.len() || examined < consumed {
            return Err(PipeError::transport(anyhow::anyhow!(
                "advance_to out of range: consumed={consumed} examined={examined} \
                 staged={}",
                staged.buf.len()
            )));
        }
        staged.buf.advance(consumed);
        staged.examined = (examined - consumed).min(staged.buf.len());
        Ok(())
    }

    fn cancel_pending_read(&self) {
        self.pending_cancel
            .lock()
            .expect("cancel lock poisoned")
            .cancel();
    }

    fn complete(&self) {
        self.completed.cancel();
    }
}

/// [`ByteSink`] over any tokio `AsyncWrite`.
pub struct StreamSink<W> {
    io: tokio::sync::Mutex<W>,
    pending_cancel: std::sync::Mutex<CancellationToken>,
    completed: CancellationToken,
}

impl<W> StreamSink<W> {
    pub fn new(io: W) -> Self {
        Self {
            io: tokio::sync::Mutex::new(io),
            pending_cancel: std::sync::Mutex::new(CancellationToken::new()),
            completed: CancellationToken::new(),
        }
    }

    fn take_pending_cancel(&self) -> CancellationToken {
        self.pending_cancel
            .lock()
            .expect("cancel lock poisoned")
            .clone()
    }

    fn rearm_pending_cancel(&self) {
        *self.pending_cancel.lock().expect("cancel lock poisoned") =
            CancellationToken::new();
    }
}

#[async_trait]
impl<W> ByteSink for StreamSink<W>
where W: AsyncWrite + Unpin + Send
{
    async fn write(
        &self,
        data: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<(), PipeError> {
        if self.completed.is_cancelled() {
            return Err(PipeError::SinkCompleted);
        }
        let caller = cancel.cloned().unwrap_or_default();
        let mut io = self.io.lock().await;
        tokio::select! {
            _ = self.completed.cancelled() => Err(PipeError::SinkCompleted),
            _ = caller.cancelled() => Err(PipeError::Canceled),
            res = io.write_all(data) => res.map_err(PipeError::from),
        }
    }

    async fn flush(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError> {
        if self.completed.is_cancelled() {
            return Ok(FlushResult::completed());
        }
        let caller = cancel.cloned().unwrap_or_default();
        let pending = self.take_pending_cancel();
        let mut io = self.io.lock().await;
        tokio::select! {
            _ = self.completed.cancelled() => Ok(FlushResult::completed()),
            _ = pending.cancelled() => {
                self.rearm_pending_cancel();
                Ok(FlushResult::canceled())
            },
            _ = caller.cancelled() => Err(PipeError::Canceled),
            res = io.flush() => res
                .map(|_| FlushResult::done())
                .map_err(PipeError::from),
        }
    }

    fn cancel_pending_flush(&self) {
        self.pending_cancel
            .lock()
            .expect("cancel lock poisoned")
            .cancel();
    }

    fn complete(&self) {
        self.completed.cancel();
    }
}
