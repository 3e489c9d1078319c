// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::pipe::{
    error::PipeError,
    result::{FlushResult, ReadResult},
};

/// A byte source as the Stable Reader consumes it.
///
/// `read` waits until at least one unexamined byte is staged and returns a
/// snapshot of everything staged-but-unconsumed; the caller reports how much
/// it consumed and examined through `advance_to`, and only then does the
/// next `read` wait for fresh bytes. This keeps framing incremental: a
/// partial frame stays staged in the source until its tail arrives.
///
/// Cancellation splits three ways:
/// - `Some(cancel)` fired → `Err(PipeError::Canceled)` (caller-owned);
/// - `cancel_pending_read` → `Ok(ReadResult { is_canceled: true, .. })`;
/// - completion (EOF, `complete`, endpoint teardown) →
///   `Ok(ReadResult { is_completed: true, .. })`, now and forever after.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn read(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReadResult, PipeError>;

    /// Non-blocking variant: `Ok(Some(..))` when unexamined bytes are
    /// already staged (or the source is completed), `Ok(None)` otherwise.
    fn try_read(&self) -> Result<Option<ReadResult>, PipeError> {
        Ok(None)
    }

    /// Consumes `consumed` bytes from the front of the last delivered
    /// buffer and marks `examined` bytes as seen (`examined >= consumed`).
    fn advance_to(&self, consumed: usize, examined: usize) -> Result<(), PipeError>;

    /// Makes the in-flight (or next) read return a canceled result instead
    /// of data. Transient: exactly one read observes it.
    fn cancel_pending_read(&self);

    /// Terminates the source; all further reads report completion.
    fn complete(&self);
}

/// A byte sink as the Stable Writer drives it.
///
/// `write` stages bytes with the transport; `flush` makes them visible to
/// the peer. Sinks for transports that can be swapped mid-frame must make
/// `flush` all-or-nothing so a frame never straddles two transports.
#[async_trait]
pub trait ByteSink: Send + Sync {
    async fn write(
        &self,
        data: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<(), PipeError>;

    async fn flush(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError>;

    /// Makes the in-flight (or next) flush return a canceled result.
    fn cancel_pending_flush(&self);

    /// Terminates the sink; all further operations report completion.
    fn complete(&self);
}
