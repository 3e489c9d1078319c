// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::pipe::{
    byte_pipe::{ByteSink, ByteSource},
    error::PipeError,
    result::{FlushResult, ReadResult},
};

/// Process-wide endpoint directory (name → endpoint). Scope is explicitly
/// the process; created lazily at first use.
static DIRECTORY: Lazy<DashMap<String, Arc<EndpointShared>>> = Lazy::new(DashMap::new);

/// Which half of an endpoint a channel claims. Side A writes what side B
/// reads and vice versa.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySide {
    A,
    B,
}

impl MemorySide {
    fn index(self) -> usize {
        match self {
            MemorySide::A => 0,
            MemorySide::B => 1,
        }
    }

    /// Queue this side reads from (written by the opposite side).
    fn read_queue(self) -> usize {
        match self {
            MemorySide::A => 1,
            MemorySide::B => 0,
        }
    }

    /// Queue this side writes to.
    fn write_queue(self) -> usize {
        match self {
            MemorySide::A => 0,
            MemorySide::B => 1,
        }
    }
}

impl std::fmt::Display for MemorySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MemorySide::A => "A",
            MemorySide::B => "B",
        })
    }
}

#[derive(Default)]
struct QueueState {
    buf: BytesMut,
    examined: usize,
}

/// One direction of an endpoint: a persistent byte queue with the examined
/// watermark of its current consumer.
#[derive(Default)]
struct ByteQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ByteQueue {
    fn snapshot(&self) -> Bytes {
        let st = self.state.lock().expect("queue lock poisoned");
        Bytes::copy_from_slice(&st.buf)
    }

    fn reset_examined(&self) {
        self.state.lock().expect("queue lock poisoned").examined = 0;
    }
}

struct EndpointState {
    allocated: bool,
    /// Severance token per attached side.
    attached: [Option<CancellationToken>; 2],
}

struct EndpointShared {
    name: String,
    queues: [ByteQueue; 2],
    state: Mutex<EndpointState>,
}

impl EndpointShared {
    fn sever_all(&self) {
        let mut st = self.state.lock().expect("endpoint lock poisoned");
        for slot in st.attached.iter_mut() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
        // Wake blocked readers so they observe the severance.
        for queue in &self.queues {
            queue.notify.notify_waiters();
        }
    }

    fn release(&self, side: MemorySide, token: &CancellationToken) {
        token.cancel();
        {
            let mut st = self.state.lock().expect("endpoint lock poisoned");
            let slot = &mut st.attached[side.index()];
            // A live replacement attachment holds an uncancelled token and
            // must not be evicted by a stale release.
            if slot.as_ref().is_some_and(|t| t.is_cancelled()) {
                *slot = None;
            }
        }
        self.queues[side.read_queue()].notify.notify_waiters();
    }
}

/// Handle API for the in-memory endpoint directory.
///
/// `allocate` creates (or re-enables) a named endpoint; `deallocate`
/// severs every current attachment while the two per-direction byte
/// queues and their unread contents survive for the next allocation, so a
/// reconnecting pair of channels loses nothing that was already flushed.
/// `remove` deletes the endpoint outright.
pub struct MemoryEndpoint;

impl MemoryEndpoint {
    pub fn allocate(name: &str) -> Result<()> {
        ensure!(!name.is_empty(), "endpoint name must not be empty");
        let entry = DIRECTORY
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(EndpointShared {
                    name: name.to_string(),
                    queues: [ByteQueue::default(), ByteQueue::default()],
                    state: Mutex::new(EndpointState {
                        allocated: false,
                        attached: [None, None],
                    }),
                })
            });
        let mut st = entry.state.lock().expect("endpoint lock poisoned");
        ensure!(!st.allocated, "endpoint '{name}' is already allocated");
        st.allocated = true;
        Ok(())
    }

    /// Severs every attachment and marks the endpoint unallocated; unread
    /// bytes stay queued. Returns whether the endpoint existed.
    pub fn deallocate(name: &str) -> bool {
        let Some(entry) = DIRECTORY.get(name) else {
            return false;
        };
        let endpoint = entry.value().clone();
        drop(entry);
        {
            let mut st = endpoint.state.lock().expect("endpoint lock poisoned");
            st.allocated = false;
        }
        endpoint.sever_all();
        true
    }

    /// Deletes the endpoint and everything it buffered.
    pub fn remove(name: &str) -> bool {
        let Some((_, endpoint)) = DIRECTORY.remove(name) else {
            return false;
        };
        endpoint.sever_all();
        true
    }

    pub fn is_allocated(name: &str) -> bool {
        DIRECTORY
            .get(name)
            .map(|e| e.state.lock().expect("endpoint lock poisoned").allocated)
            .unwrap_or(false)
    }

    /// Claims `side` of an allocated endpoint. Fails when the endpoint is
    /// missing, unallocated, or the side is still attached elsewhere.
    pub(crate) fn attach(
        name: &str,
        side: MemorySide,
    ) -> Result<(Arc<MemorySource>, Arc<MemorySink>)> {
        let endpoint = DIRECTORY
            .get(name)
            .map(|e| e.value().clone())
            .with_context(|| format!("endpoint '{name}' does not exist"))?;
        let token = {
            let mut st = endpoint.state.lock().expect("endpoint lock poisoned");
            if !st.allocated {
                bail!("endpoint '{name}' is not allocated");
            }
            let slot = &mut st.attached[side.index()];
            if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
                bail!("side {side} of endpoint '{name}' is already attached");
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };
        // A fresh consumer re-examines whatever is still queued.
        endpoint.queues[side.read_queue()].reset_examined();

        let source = Arc::new(MemorySource {
            endpoint: endpoint.clone(),
            side,
            severed: token.clone(),
            pending_cancel: Mutex::new(CancellationToken::new()),
        });
        let sink = Arc::new(MemorySink {
            endpoint,
            side,
            severed: token,
            staged: Mutex::new(BytesMut::new()),
            pending_cancel: Mutex::new(CancellationToken::new()),
        });
        Ok((source, sink))
    }
}

/// [`ByteSource`] over the endpoint's persistent read queue.
///
/// Reads are snapshots; bytes leave the queue only through `advance_to`,
/// so nothing staged is lost when an attachment is severed mid-frame.
pub struct MemorySource {
    endpoint: Arc<EndpointShared>,
    side: MemorySide,
    severed: CancellationToken,
    pending_cancel: Mutex<CancellationToken>,
}

impl MemorySource {
    fn queue(&self) -> &ByteQueue {
        &self.endpoint.queues[self.side.read_queue()]
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
impl ByteSource for MemorySource {
    async fn read(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReadResult, PipeError> {
        let caller = cancel.cloned().unwrap_or_default();
        let pending = self.take_pending_cancel();
        loop {
            {
                let st = self.queue().state.lock().expect("queue lock poisoned");
                if st.buf.len() > st.examined {
                    return Ok(ReadResult::data(Bytes::copy_from_slice(&st.buf)));
                }
            }
            if self.severed.is_cancelled() {
                return Ok(ReadResult::completed(self.queue().snapshot()));
            }

            let notified = self.queue().notify.notified();
            {
                // Data may have landed between the check and the future.
                let st = self.queue().state.lock().expect("queue lock poisoned");
                if st.buf.len() > st.examined {
                    continue;
                }
            }
            tokio::select! {
                _ = self.severed.cancelled() => {
                    return Ok(ReadResult::completed(self.queue().snapshot()));
                },
                _ = pending.cancelled() => {
                    self.rearm_pending_cancel();
                    return Ok(ReadResult::canceled(self.queue().snapshot()));
                },
                _ = caller.cancelled() => return Err(PipeError::Canceled),
                _ = notified => {},
            }
        }
    }

    fn try_read(&self) -> Result<Option<ReadResult>, PipeError> {
        let st = self.queue().state.lock().expect("queue lock poisoned");
        if st.buf.len() > st.examined {
            return Ok(Some(ReadResult::data(Bytes::copy_from_slice(&st.buf))));
        }
        if self.severed.is_cancelled() {
            return Ok(Some(ReadResult::completed(Bytes::copy_from_slice(&st.buf))));
        }
        Ok(None)
    }

    fn advance_to(&self, consumed: usize, examined: usize) -> Result<(), PipeError> {
        let mut st = self.queue().state.lock().expect("queue lock poisoned");
        if consumed > st.buf.len() || examined < consumed {
            return Err(PipeError::transport(anyhow::anyhow!(
                "advance_to out of range on endpoint '{}': consumed={consumed} \
                 examined={examined} queued={}",
                self.endpoint.name,
                st.buf.len()
            )));
        }
        st.buf.advance(consumed);
        if self.severed.is_cancelled() {
            // A late advance from a severed attachment still consumes its
            // parsed frame, but the examined watermark belongs to the
            // successor now and is only shifted, never raised.
            st.examined = st.examined.saturating_sub(consumed);
        } else {
            st.examined = (examined - consumed).min(st.buf.len());
        }
        Ok(())
    }

    fn cancel_pending_read(&self) {
        self.pending_cancel
            .lock()
            .expect("cancel lock poisoned")
            .cancel();
    }

    fn complete(&self) {
        self.endpoint.release(self.side, &self.severed);
    }
}

/// [`ByteSink`] over the endpoint's persistent write queue.
///
/// Writes stage locally; `flush` commits the staged bytes to the shared
/// queue atomically, so a severed sink never leaves a half-frame behind
/// and a reconnect never duplicates one.
pub struct MemorySink {
    endpoint: Arc<EndpointShared>,
    side: MemorySide,
    severed: CancellationToken,
    staged: Mutex<BytesMut>,
    pending_cancel: Mutex<CancellationToken>,
}

impl MemorySink {
    fn queue(&self) -> &ByteQueue {
        &self.endpoint.queues[self.side.write_queue()]
    }
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write(
        &self,
        data: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<(), PipeError> {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(PipeError::Canceled);
        }
        if self.severed.is_cancelled() {
            return Err(PipeError::transport(anyhow::anyhow!(
                "endpoint '{}' was deallocated",
                self.endpoint.name
            )));
        }
        self.staged
            .lock()
            .expect("staged lock poisoned")
            .extend_from_slice(data);
        Ok(())
    }

    async fn flush(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError> {
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(PipeError::Canceled);
        }
        let cancel_fired = {
            let mut pending =
                self.pending_cancel.lock().expect("cancel lock poisoned");
            if pending.is_cancelled() {
                *pending = CancellationToken::new();
                true
            } else {
                false
            }
        };
        if cancel_fired {
            return Ok(FlushResult::canceled());
        }
        if self.severed.is_cancelled() {
            return Err(PipeError::transport(anyhow::anyhow!(
                "endpoint '{}' was deallocated",
                self.endpoint.name
            )));
        }
        let staged = {
            let mut staged = self.staged.lock().expect("staged lock poisoned");
            staged.split()
        };
        if !staged.is_empty() {
            let mut st = self.queue().state.lock().expect("queue lock poisoned");
            st.buf.extend_from_slice(&staged);
        }
        self.queue().notify.notify_waiters();
        Ok(FlushResult::done())
    }

    fn cancel_pending_flush(&self) {
        self.pending_cancel
            .lock()
            .expect("cancel lock poisoned")
            .cancel();
    }

    fn complete(&self) {
        self.endpoint.release(self.side, &self.severed);
    }
}
