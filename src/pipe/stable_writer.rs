// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicI8, AtomicI64, AtomicU32, Ordering},
};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipe::{
    behavior::{CompletionAction, DefaultPipeBehavior, ErrorAction, StablePipeBehavior},
    buffer::FrameBuffer,
    byte_pipe::ByteSink,
    error::PipeError,
    result::FlushResult,
};

const IDLE: i8 = 0;
const WRITING: i8 = 1;
const COMPLETED_DURING: i8 = -1;

/// Releases the busy flag even when the owning future is dropped at an
/// await point (a caller-side timeout or select abandoning the flush).
struct BusyGuard<'a> {
    flag: &'a AtomicI8,
    armed: bool,
}

impl<'a> BusyGuard<'a> {
    fn new(flag: &'a AtomicI8) -> Self {
        Self { flag, armed: true }
    }

    fn finish(mut self) -> bool {
        self.armed = false;
        self.flag.swap(IDLE, Ordering::SeqCst) == COMPLETED_DURING
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.swap(IDLE, Ordering::SeqCst);
        }
    }
}

type DataWrittenCallback = Box<dyn Fn(&Bytes) + Send + Sync>;

struct Attachment {
    sink: Arc<dyn ByteSink>,
    complete_when_done: bool,
}

#[derive(Default)]
struct WriterState {
    attachment: Option<Attachment>,
    completed: bool,
}

/// Decorator over a byte sink whose inner sink may be swapped or closed
/// while a flush is in flight.
///
/// Writes accumulate in a private buffer; `flush_async` is the only
/// operation that touches the inner sink, which makes every flush atomic
/// from the sender's point of view: either the whole pending buffer reached
/// the (then-)current inner sink or none of it did. The buffer survives
/// transport swaps so a frame in progress is not lost mid-buffer; it is
/// discarded on a successful flush or on writer completion.
pub struct StableWriter {
    state: Mutex<WriterState>,
    state_change: Notify,
    writing: AtomicI8,
    behavior: RwLock<Arc<dyn StablePipeBehavior>>,
    /// Milliseconds; `<= 0` disables the internal flush timeout.
    default_timeout_ms: AtomicI64,
    /// Additional flush attempts on timeout, per flush.
    retry_write_count: AtomicU32,
    buffer: Mutex<FrameBuffer>,
    on_data_written: Mutex<Vec<DataWrittenCallback>>,
    complete_error: Mutex<Option<PipeError>>,
}

impl Default for StableWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StableWriter {
    pub fn new() -> Self {
        Self::with_behavior(Arc::new(DefaultPipeBehavior))
    }

    pub fn with_behavior(behavior: Arc<dyn StablePipeBehavior>) -> Self {
        Self {
            state: Mutex::new(WriterState::default()),
            state_change: Notify::new(),
            writing: AtomicI8::new(IDLE),
            behavior: RwLock::new(behavior),
            default_timeout_ms: AtomicI64::new(-1),
            retry_write_count: AtomicU32::new(0),
            buffer: Mutex::new(FrameBuffer::new()),
            on_data_written: Mutex::new(Vec::new()),
            complete_error: Mutex::new(None),
        }
    }

    pub fn set_behavior(&self, behavior: Arc<dyn StablePipeBehavior>) {
        *self.behavior.write().expect("behavior lock poisoned") = behavior;
    }

    pub(crate) fn behavior(&self) -> Arc<dyn StablePipeBehavior> {
        self.behavior.read().expect("behavior lock poisoned").clone()
    }

    /// Sets the internal flush timeout; `None` disables it.
    pub fn set_default_timeout(&self, timeout: Option<std::time::Duration>) {
        let ms = timeout.map(|d| d.as_millis() as i64).unwrap_or(-1);
        self.default_timeout_ms.store(ms, Ordering::SeqCst);
    }

    fn default_timeout(&self) -> Option<std::time::Duration> {
        let ms = self.default_timeout_ms.load(Ordering::SeqCst);
        (ms > 0).then(|| std::time::Duration::from_millis(ms as u64))
    }

    /// Number of additional flush attempts on timeout (effective only when
    /// a flush timeout is configured).
    pub fn set_retry_write_count(&self, count: u32) {
        self.retry_write_count.store(count, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().expect("state lock poisoned").completed
    }

    pub fn has_inner(&self) -> bool {
        self.state
            .lock()
            .expect("state lock poisoned")
            .attachment
            .is_some()
    }

    pub fn completion_error(&self) -> Option<String> {
        self.complete_error
            .lock()
            .expect("error lock poisoned")
            .as_ref()
            .map(|e| e.to_string())
    }

    /// Registers a callback invoked after every flush that actually
    /// transmitted, with the exact bytes that were sent.
    pub fn on_data_written(&self, callback: impl Fn(&Bytes) + Send + Sync + 'static) {
        self.on_data_written
            .lock()
            .expect("callback lock poisoned")
            .push(Box::new(callback));
    }

    fn current_sink(&self) -> Option<Arc<dyn ByteSink>> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .attachment
            .as_ref()
            .map(|a| a.sink.clone())
    }

    fn is_current(&self, sink: &Arc<dyn ByteSink>) -> bool {
        self.state
            .lock()
            .expect("state lock poisoned")
            .attachment
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(&a.sink, sink))
    }

    /// Attaches (or replaces) the inner sink; same swap semantics as the
    /// Stable Reader. The pending buffer is kept so an in-progress frame is
    /// delivered to the new sink on the next flush.
    pub fn set_inner(&self, sink: Arc<dyn ByteSink>, complete_when_done: bool) -> bool {
        let prev = {
            let mut st = self.state.lock().expect("state lock poisoned");
            if st.completed {
                return false;
            }
            if let Some(att) = &mut st.attachment {
                if Arc::ptr_eq(&att.sink, &sink) {
                    att.complete_when_done = complete_when_done;
                    return true;
                }
            }
            st.attachment.replace(Attachment {
                sink,
                complete_when_done,
            })
        };
        self.release_attachment(prev);
        self.state_change.notify_waiters();
        true
    }

    /// Detaches the inner sink; with `complete == true` also terminates the
    /// writer and drops the pending buffer.
    pub fn close(&self, complete: bool) -> bool {
        let (prev, changed) = {
            let mut st = self.state.lock().expect("state lock poisoned");
            if st.completed {
                return false;
            }
            let prev = st.attachment.take();
            let mut changed = prev.is_some();
            if complete {
                st.completed = true;
                changed = true;
            }
            (prev, changed)
        };
        if complete {
            let _ = self.writing.compare_exchange(
                WRITING,
                COMPLETED_DURING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            self.buffer.lock().expect("buffer lock poisoned").reset();
        }
        self.release_attachment(prev);
        if changed {
            self.state_change.notify_waiters();
        }
        changed
    }

    /// Terminates the writer, recording the first completion error.
    pub fn complete(&self, error: Option<PipeError>) {
        if let Some(err) = error {
            let mut slot = self.complete_error.lock().expect("error lock poisoned");
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.close(true);
    }

    fn release_attachment(&self, prev: Option<Attachment>) {
        if let Some(prev) = prev {
            prev.sink.cancel_pending_flush();
            if prev.complete_when_done {
                prev.sink.complete();
            }
        }
    }

    /// Forwards a cancel to the currently-attached sink.
    pub fn cancel_pending_flush(&self) {
        if let Some(sink) = self.current_sink() {
            sink.cancel_pending_flush();
        }
    }

    /// Appends raw bytes to the pending frame buffer.
    pub fn write_bytes(&self, data: &[u8]) {
        if self.is_completed() {
            return;
        }
        self.buffer
            .lock()
            .expect("buffer lock poisoned")
            .put(data);
    }

    /// Direct formatter access to the pending frame buffer. Returns `None`
    /// once the writer is completed.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> Option<R> {
        if self.is_completed() {
            return None;
        }
        Some(
            self.buffer
                .lock()
                .expect("buffer lock poisoned")
                .with_buf(f),
        )
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.lock().expect("buffer lock poisoned").len()
    }

    /// Delivers the pending buffer to the inner sink and flushes it.
    ///
    /// If the same inner sink is still attached from a previous partial
    /// delivery, writing resumes from the recorded position; any other sink
    /// receives the whole buffer. On success the `on_data_written`
    /// callbacks fire with the transmitted bytes and the buffer is
    /// discarded; on a canceled result the buffer is kept so the caller may
    /// retry.
    pub async fn flush_async(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError> {
        if self.buffer.lock().expect("buffer lock poisoned").is_empty() {
            return Ok(FlushResult {
                is_canceled: false,
                is_completed: self.is_completed(),
            });
        }
        if self
            .writing
            .compare_exchange(IDLE, WRITING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if self.is_completed() {
                return Ok(FlushResult::completed());
            }
            return Err(PipeError::AlreadyWriting);
        }

        let guard = BusyGuard::new(&self.writing);
        let result = self.flush_loop(cancel).await;

        let late = guard.finish();
        match result {
            Ok(mut r) if late => {
                r.is_completed = true;
                r.is_canceled = false;
                Ok(r)
            },
            other => other,
        }
    }

    async fn flush_loop(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError> {
        if self.is_completed() {
            return Ok(FlushResult::completed());
        }

        loop {
            let Some(sink) = self.wait_for_inner().await else {
                return Ok(FlushResult::completed());
            };

            // Resume from the delivered position when re-attached to the
            // same sink; any other sink gets the whole buffer.
            let (data, full_len) = self
                .buffer
                .lock()
                .expect("buffer lock poisoned")
                .pending_for(&sink);

            if !data.is_empty() {
                let write_res = match self.default_timeout() {
                    Some(dur) if cancel.is_none() => {
                        match tokio::time::timeout(dur, sink.write(&data, None)).await {
                            Ok(r) => r,
                            Err(_) => Err(PipeError::FlushTimeout(dur)),
                        }
                    },
                    _ => sink.write(&data, cancel).await,
                };
                match write_res {
                    Ok(()) => {},
                    Err(PipeError::Canceled) => return Err(PipeError::Canceled),
                    Err(err) => match self.route_error(&sink, err)? {
                        RouteOutcome::Retry => continue,
                        RouteOutcome::Done(result) => return Ok(result),
                    },
                }
                self.buffer
                    .lock()
                    .expect("buffer lock poisoned")
                    .mark_delivered(&sink, full_len);
            }

            let flush_res = self.flush_with_retries(&sink, cancel).await;
            match flush_res {
                Err(PipeError::Canceled) => return Err(PipeError::Canceled),
                Err(err) => match self.route_error(&sink, err)? {
                    RouteOutcome::Retry => continue,
                    RouteOutcome::Done(result) => return Ok(result),
                },
                Ok(result) if result.is_completed => {
                    match self.handle_inner_completed()? {
                        Some(result) => return Ok(result),
                        None => continue,
                    }
                },
                Ok(result) if result.is_canceled => {
                    if self.behavior().return_inner_canceled() {
                        self.behavior().on_cancel();
                        return Ok(result);
                    }
                    continue;
                },
                Ok(result) => {
                    let snapshot = self
                        .buffer
                        .lock()
                        .expect("buffer lock poisoned")
                        .snapshot();
                    for callback in self
                        .on_data_written
                        .lock()
                        .expect("callback lock poisoned")
                        .iter()
                    {
                        callback(&snapshot);
                    }
                    self.buffer
                        .lock()
                        .expect("buffer lock poisoned")
                        .discard();
                    return Ok(result);
                },
            }
        }
    }

    /// One flush on the inner sink, with the configured timeout/retry
    /// strategy. With zero retries the caller's token (when present) owns
    /// timeout responsibility; otherwise caller token and internal timeout
    /// are combined and a timeout only surfaces after the retries run out.
    async fn flush_with_retries(
        &self,
        sink: &Arc<dyn ByteSink>,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError> {
        let retries = self.retry_write_count.load(Ordering::SeqCst);
        let timeout_dur = self.default_timeout();

        if retries == 0 {
            return match (cancel, timeout_dur) {
                (Some(token), _) => sink.flush(Some(token)).await,
                (None, Some(dur)) => {
                    match tokio::time::timeout(dur, sink.flush(None)).await {
                        Ok(r) => r,
                        Err(_) => Err(PipeError::FlushTimeout(dur)),
                    }
                },
                (None, None) => sink.flush(None).await,
            };
        }

        let Some(dur) = timeout_dur else {
            return sink.flush(cancel).await;
        };
        let mut left = retries;
        loop {
            match tokio::time::timeout(dur, sink.flush(cancel)).await {
                Ok(r) => return r,
                Err(_) => {
                    if cancel.is_some_and(|t| t.is_cancelled()) {
                        return Err(PipeError::Canceled);
                    }
                    if left == 0 {
                        return Err(PipeError::FlushTimeout(dur));
                    }
                    left -= 1;
                    debug!(
                        "flush timed out after {dur:?}, retrying ({left} attempts \
                         left)"
                    );
                },
            }
        }
    }

    fn route_error(
        &self,
        sink: &Arc<dyn ByteSink>,
        err: PipeError,
    ) -> Result<RouteOutcome, PipeError> {
        if !self.is_current(sink) {
            self.behavior().on_swallowed(&err);
            return Ok(RouteOutcome::Retry);
        }
        if err.is_completed_inner() {
            self.behavior().on_swallowed(&err);
            return match self.handle_inner_completed()? {
                Some(result) => Ok(RouteOutcome::Done(result)),
                None => Ok(RouteOutcome::Retry),
            };
        }
        match self.behavior().on_error(&err) {
            ErrorAction::Retry => Ok(RouteOutcome::Retry),
            ErrorAction::Cancel => {
                self.behavior().on_cancel();
                Ok(RouteOutcome::Done(if self.is_completed() {
                    FlushResult::completed()
                } else {
                    FlushResult::canceled()
                }))
            },
            ErrorAction::Throw => Err(err),
        }
    }

    fn handle_inner_completed(&self) -> Result<Option<FlushResult>, PipeError> {
        match self.behavior().on_inner_completed() {
            CompletionAction::Retry => {
                // Keep the buffer: the frame in progress goes to the next
                // inner sink in full.
                self.close(false);
                Ok(None)
            },
            CompletionAction::Throw => Err(PipeError::SinkCompleted),
            CompletionAction::Complete => {
                self.complete(None);
                Ok(Some(FlushResult::completed()))
            },
        }
    }

    async fn wait_for_inner(&self) -> Option<Arc<dyn ByteSink>> {
        loop {
            let notified = self.state_change.notified();
            {
                let st = self.state.lock().expect("state lock poisoned");
                if st.completed {
                    return None;
                }
                if let Some(att) = &st.attachment {
                    return Some(att.sink.clone());
                }
            }
            notified.await;
        }
    }
}

enum RouteOutcome {
    Retry,
    Done(FlushResult),
}
