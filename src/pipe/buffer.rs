// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};

use crate::pipe::byte_pipe::ByteSink;

/// Growable scratch buffer the Stable Writer coalesces pre-flush writes
/// into, together with the bookkeeping needed to resume a partially
/// delivered flush on the same sink without re-sending bytes.
///
/// The buffer is retained across transport swaps so a frame in progress is
/// not lost on a mid-buffer swap; it is discarded on a successful flush.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    data: BytesMut,
    mark: Option<FlushMark>,
}

/// Sink identity and position of the last successful partial delivery.
#[derive(Debug)]
struct FlushMark {
    sink: Weak<dyn ByteSink>,
    pos: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends raw bytes to the pending frame data.
    pub fn put(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Gives a formatter direct access to the underlying buffer. The
    /// closure's return value is passed through unchanged.
    pub fn with_buf<R>(&mut self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        f(&mut self.data)
    }

    /// Full snapshot of the pending bytes (used by the on-data-written
    /// event before the buffer is discarded).
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    /// Bytes still owed to `sink` plus the total length they extend to.
    ///
    /// If `sink` is the same sink the last delivery went to, writing resumes
    /// from the recorded position; any other sink gets the entire buffer.
    pub fn pending_for(&self, sink: &Arc<dyn ByteSink>) -> (Bytes, usize) {
        let start = match &self.mark {
            Some(mark) if Weak::ptr_eq(&mark.sink, &Arc::downgrade(sink)) => {
                mark.pos.min(self.data.len())
            },
            _ => 0,
        };
        (Bytes::copy_from_slice(&self.data[start..]), self.data.len())
    }

    /// Records that everything up to `pos` reached `sink`.
    pub fn mark_delivered(&mut self, sink: &Arc<dyn ByteSink>, pos: usize) {
        self.mark = Some(FlushMark {
            sink: Arc::downgrade(sink),
            pos,
        });
    }

    /// Discards the pending bytes after a confirmed flush. Capacity is
    /// reused for the next frame.
    pub fn discard(&mut self) {
        self.data.clear();
        self.mark = None;
    }

    /// Drops everything, delivery bookkeeping included (terminal failure or
    /// writer completion).
    pub fn reset(&mut self) {
        self.discard();
    }
}
