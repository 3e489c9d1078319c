// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;

/// Outcome of a read on a byte source.
///
/// `buffer` is a snapshot of every staged-but-unconsumed byte; the caller
/// reports consumption back through `advance_to`. `is_completed` means the
/// source will yield no more data. `is_canceled` is a transient per-operation
/// flag raised by `cancel_pending_read` and does not imply completion.
#[derive(Debug, Clone, Default)]
pub struct ReadResult {
    pub buffer: Bytes,
    pub is_canceled: bool,
    pub is_completed: bool,
}

impl ReadResult {
    pub fn completed(buffer: Bytes) -> Self {
        Self {
            buffer,
            is_canceled: false,
            is_completed: true,
        }
    }

    pub fn canceled(buffer: Bytes) -> Self {
        Self {
            buffer,
            is_canceled: true,
            is_completed: false,
        }
    }

    pub fn data(buffer: Bytes) -> Self {
        Self {
            buffer,
            is_canceled: false,
            is_completed: false,
        }
    }
}

/// Outcome of a flush on a byte sink. Same flag semantics as [`ReadResult`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushResult {
    pub is_canceled: bool,
    pub is_completed: bool,
}

impl FlushResult {
    pub fn completed() -> Self {
        Self {
            is_canceled: false,
            is_completed: true,
        }
    }

    pub fn canceled() -> Self {
        Self {
            is_canceled: true,
            is_completed: false,
        }
    }

    pub fn done() -> Self {
        Self::default()
    }
}
