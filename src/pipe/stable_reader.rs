// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicI8, AtomicI64, Ordering},
};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipe::{
    behavior::{CompletionAction, DefaultPipeBehavior, ErrorAction, StablePipeBehavior},
    byte_pipe::ByteSource,
    error::PipeError,
    result::ReadResult,
};

const IDLE: i8 = 0;
const READING: i8 = 1;
const COMPLETED_DURING: i8 = -1;

/// Releases the busy flag even when the owning future is dropped at an
/// await point (a caller-side timeout or select abandoning the read).
struct BusyGuard<'a> {
    flag: &'a AtomicI8,
    armed: bool,
}

impl<'a> BusyGuard<'a> {
    fn new(flag: &'a AtomicI8) -> Self {
        Self { flag, armed: true }
    }

    /// Normal exit: releases the flag and reports whether completion
    /// arrived while the operation was in flight.
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

/// Attached inner source plus the completion request made when it was set.
struct Attachment {
    source: Arc<dyn ByteSource>,
    complete_when_done: bool,
}

#[derive(Default)]
struct ReaderState {
    attachment: Option<Attachment>,
    completed: bool,
}

/// Decorator over a byte source whose inner source may be swapped or closed
/// atomically while a read is in flight.
///
/// The reader never owns its inner source: swapping one out does not
/// dispose it unless `complete_when_done` was requested when it was set.
/// At most one read is in flight at a time; a second concurrent read fails
/// with [`PipeError::AlreadyReading`]. Errors, cancellations, and inner
/// completions are routed through the configured [`StablePipeBehavior`],
/// which decides between retrying (waiting for a fresh inner), cancelling,
/// and surfacing the failure.
pub struct StableReader {
    state: Mutex<ReaderState>,
    state_change: Notify,
    reading: AtomicI8,
    behavior: RwLock<Arc<dyn StablePipeBehavior>>,
    /// Milliseconds; `<= 0` disables the internal read timeout.
    default_timeout_ms: AtomicI64,
    /// Source of the last successful read, retained so `advance_to` can
    /// still reach it after a swap.
    advance_source: Mutex<Option<Arc<dyn ByteSource>>>,
    complete_error: Mutex<Option<PipeError>>,
}

impl Default for StableReader {
    fn default() -> Self {
        Self::new()
    }
}

impl StableReader {
    pub fn new() -> Self {
        Self::with_behavior(Arc::new(DefaultPipeBehavior))
    }

    pub fn with_behavior(behavior: Arc<dyn StablePipeBehavior>) -> Self {
        Self {
            state: Mutex::new(ReaderState::default()),
            state_change: Notify::new(),
            reading: AtomicI8::new(IDLE),
            behavior: RwLock::new(behavior),
            default_timeout_ms: AtomicI64::new(-1),
            advance_source: Mutex::new(None),
            complete_error: Mutex::new(None),
        }
    }

    pub fn set_behavior(&self, behavior: Arc<dyn StablePipeBehavior>) {
        *self.behavior.write().expect("behavior lock poisoned") = behavior;
    }

    pub(crate) fn behavior(&self) -> Arc<dyn StablePipeBehavior> {
        self.behavior.read().expect("behavior lock poisoned").clone()
    }

    /// Sets the internal read timeout; `None` disables it.
    pub fn set_default_timeout(&self, timeout: Option<std::time::Duration>) {
        let ms = timeout.map(|d| d.as_millis() as i64).unwrap_or(-1);
        self.default_timeout_ms.store(ms, Ordering::SeqCst);
    }

    fn default_timeout(&self) -> Option<std::time::Duration> {
        let ms = self.default_timeout_ms.load(Ordering::SeqCst);
        (ms > 0).then(|| std::time::Duration::from_millis(ms as u64))
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

    /// First error passed to [`StableReader::complete`], if any.
    pub fn completion_error(&self) -> Option<String> {
        self.complete_error
            .lock()
            .expect("error lock poisoned")
            .as_ref()
            .map(|e| e.to_string())
    }

    fn current_source(&self) -> Option<Arc<dyn ByteSource>> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .attachment
            .as_ref()
            .map(|a| a.source.clone())
    }

    fn is_current(&self, source: &Arc<dyn ByteSource>) -> bool {
        self.state
            .lock()
            .expect("state lock poisoned")
            .attachment
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(&a.source, source))
    }

    /// Attaches (or replaces) the inner source. Returns `false` once the
    /// reader is completed.
    ///
    /// Re-setting the currently attached source only updates
    /// `complete_when_done`; no state-change signal fires. Replacing a
    /// different source cancels its pending read and completes it iff its
    /// own `complete_when_done` was set.
    pub fn set_inner(
        &self,
        source: Arc<dyn ByteSource>,
        complete_when_done: bool,
    ) -> bool {
        let prev = {
            let mut st = self.state.lock().expect("state lock poisoned");
            if st.completed {
                return false;
            }
            if let Some(att) = &mut st.attachment {
                if Arc::ptr_eq(&att.source, &source) {
                    att.complete_when_done = complete_when_done;
                    return true;
                }
            }
            st.attachment.replace(Attachment {
                source,
                complete_when_done,
            })
        };
        self.release_attachment(prev);
        self.state_change.notify_waiters();
        true
    }

    /// Detaches the inner source; with `complete == true` also terminates
    /// the reader (a pending read wakes up and reports completion).
    /// Returns whether anything changed.
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
            // Convey late completion to the in-flight read's exit path.
            let _ = self.reading.compare_exchange(
                READING,
                COMPLETED_DURING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        self.release_attachment(prev);
        if changed {
            self.state_change.notify_waiters();
        }
        changed
    }

    /// Terminates the reader, recording the first completion error.
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
            prev.source.cancel_pending_read();
            if prev.complete_when_done {
                prev.source.complete();
            }
        }
    }

    /// Forwards a cancel to the currently-attached inner so the awaiting
    /// read returns a canceled result instead of an error.
    pub fn cancel_pending_read(&self) {
        if self.is_completed() {
            return;
        }
        if self.reading.load(Ordering::SeqCst) == READING {
            if let Some(source) = self.current_source() {
                source.cancel_pending_read();
            }
        }
    }

    /// Consumes/examines the buffer delivered by the last successful read.
    ///
    /// A no-op when no source is retained. Errors are re-raised only when
    /// the retained source is still the current one; after a concurrent
    /// swap they are reported to the behavior and swallowed.
    pub fn advance_to(&self, consumed: usize, examined: usize) -> Result<(), PipeError> {
        let source = self
            .advance_source
            .lock()
            .expect("advance lock poisoned")
            .clone();
        let Some(source) = source else {
            return Ok(());
        };
        match source.advance_to(consumed, examined) {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.is_current(&source) {
                    Err(err)
                } else {
                    self.behavior().on_swallowed(&err);
                    Ok(())
                }
            },
        }
    }

    /// Consume-only shorthand for [`StableReader::advance_to`].
    pub fn advance(&self, consumed: usize) -> Result<(), PipeError> {
        self.advance_to(consumed, consumed)
    }

    /// Non-blocking read: `Ok(None)` when no unexamined bytes are staged.
    pub fn try_read(&self) -> Result<Option<ReadResult>, PipeError> {
        if self.is_completed() {
            return Ok(Some(ReadResult::completed(Bytes::new())));
        }
        if self
            .reading
            .compare_exchange(IDLE, READING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipeError::AlreadyReading);
        }
        let out = match self.current_source() {
            None => Ok(None),
            Some(source) => match source.try_read() {
                Ok(Some(result)) => {
                    *self
                        .advance_source
                        .lock()
                        .expect("advance lock poisoned") = Some(source);
                    Ok(Some(result))
                },
                Ok(None) => Ok(None),
                Err(err) => Err(err),
            },
        };
        let late = self.reading.swap(IDLE, Ordering::SeqCst) == COMPLETED_DURING;
        match out {
            Ok(Some(mut r)) if late => {
                r.is_completed = true;
                r.is_canceled = false;
                Ok(Some(r))
            },
            Ok(None) if late => Ok(Some(ReadResult::completed(Bytes::new()))),
            other => other,
        }
    }

    /// Reads from the inner source, surviving swaps and routing failures
    /// through the behavior.
    ///
    /// With `Some(cancel)` the caller owns timeout responsibility and a
    /// fired token propagates as [`PipeError::Canceled`]; with `None` the
    /// reader arms its default timeout (if configured) and a triggered
    /// timeout is presented to the behavior as [`PipeError::ReadTimeout`].
    pub async fn read_async(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReadResult, PipeError> {
        if self
            .reading
            .compare_exchange(IDLE, READING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if self.is_completed() {
                return Ok(ReadResult::completed(Bytes::new()));
            }
            return Err(PipeError::AlreadyReading);
        }

        let guard = BusyGuard::new(&self.reading);
        let result = self.read_loop(cancel).await;

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

    async fn read_loop(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReadResult, PipeError> {
        if self.is_completed() {
            return Ok(ReadResult::completed(Bytes::new()));
        }

        loop {
            let Some(source) = self.wait_for_inner().await else {
                return Ok(ReadResult::completed(Bytes::new()));
            };
            *self
                .advance_source
                .lock()
                .expect("advance lock poisoned") = Some(source.clone());

            let read_res = match cancel {
                Some(token) => source.read(Some(token)).await,
                None => match self.default_timeout() {
                    Some(dur) => {
                        match tokio::time::timeout(dur, source.read(None)).await {
                            Ok(r) => r,
                            Err(_) => Err(PipeError::ReadTimeout(dur)),
                        }
                    },
                    None => source.read(None).await,
                },
            };

            match read_res {
                // Caller-supplied cancellation always propagates unchanged.
                Err(PipeError::Canceled) => return Err(PipeError::Canceled),
                Err(err) => {
                    if !self.is_current(&source) {
                        self.behavior().on_swallowed(&err);
                        continue;
                    }
                    if err.is_completed_inner() {
                        self.behavior().on_swallowed(&err);
                        match self.handle_inner_completed(Bytes::new())? {
                            Some(result) => return Ok(result),
                            None => continue,
                        }
                    }
                    match self.behavior().on_error(&err) {
                        ErrorAction::Retry => continue,
                        ErrorAction::Cancel => {
                            self.behavior().on_cancel();
                            return Ok(if self.is_completed() {
                                ReadResult::completed(Bytes::new())
                            } else {
                                ReadResult::canceled(Bytes::new())
                            });
                        },
                        ErrorAction::Throw => return Err(err),
                    }
                },
                Ok(result) => {
                    if result.is_completed {
                        match self.handle_inner_completed(result.buffer)? {
                            Some(result) => return Ok(result),
                            None => continue,
                        }
                    }
                    if result.buffer.is_empty() && !result.is_canceled {
                        continue;
                    }
                    if result.is_canceled && !self.behavior().return_inner_canceled() {
                        continue;
                    }
                    if result.is_canceled {
                        self.behavior().on_cancel();
                    }
                    return Ok(result);
                },
            }
        }
    }

    /// Routes an inner completion through the behavior. `Ok(None)` means
    /// "detached non-terminally, retry with the next inner".
    fn handle_inner_completed(
        &self,
        buffer: Bytes,
    ) -> Result<Option<ReadResult>, PipeError> {
        match self.behavior().on_inner_completed() {
            CompletionAction::Retry => {
                self.close(false);
                if buffer.is_empty() {
                    Ok(None)
                } else {
                    // The completed inner delivered data in the same
                    // result; hand it out and let the next call re-enter.
                    debug!("inner source completed with data still in flight");
                    Ok(Some(ReadResult::data(buffer)))
                }
            },
            CompletionAction::Throw => Err(PipeError::SourceCompleted),
            CompletionAction::Complete => {
                self.complete(None);
                Ok(Some(ReadResult::completed(buffer)))
            },
        }
    }

    async fn wait_for_inner(&self) -> Option<Arc<dyn ByteSource>> {
        loop {
            let notified = self.state_change.notified();
            {
                let st = self.state.lock().expect("state lock poisoned");
                if st.completed {
                    return None;
                }
                if let Some(att) = &st.attachment {
                    return Some(att.source.clone());
                }
            }
            notified.await;
        }
    }
}
