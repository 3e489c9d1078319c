// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use thiserror::Error;

/// Error taxonomy shared by the byte-pipe and message layers.
///
/// Behaviors pattern-match on these variants to decide between retrying,
/// cancelling, and surfacing an error, so the classification here is part of
/// the public contract: timeouts are never treated as communication faults,
/// caller cancellations always propagate, and only `Transport` feeds the
/// channel's reconnect machinery.
#[derive(Debug, Error)]
pub enum PipeError {
    /// A read on the inner byte source exceeded the configured timeout.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// A flush on the inner byte sink exceeded the configured timeout.
    #[error("flush timed out after {0:?}")]
    FlushTimeout(Duration),

    /// A framed receive exceeded the message-level timeout.
    #[error("message receive timed out after {0:?}")]
    MessageReadTimeout(Duration),

    /// A framed send exceeded the message-level timeout.
    #[error("message send timed out after {0:?}")]
    MessageWriteTimeout(Duration),

    /// The caller-supplied cancellation token fired.
    #[error("operation canceled")]
    Canceled,

    /// A second read was attempted while one was already in flight.
    #[error("a read is already in progress on this reader")]
    AlreadyReading,

    /// A second flush was attempted while one was already in flight.
    #[error("a flush is already in progress on this writer")]
    AlreadyWriting,

    /// The inner byte source was completed outside of the reader's control.
    #[error("the inner byte source was completed outside of the reader's control")]
    SourceCompleted,

    /// The inner byte sink was completed outside of the writer's control.
    #[error("the inner byte sink was completed outside of the writer's control")]
    SinkCompleted,

    /// Any other failure raised by the inner source/sink (I/O, endpoint
    /// teardown, protocol violations of the transport).
    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    /// Invalid configuration detected at channel create or reconfigure time.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl PipeError {
    /// True for every timeout-class variant, message-level ones included.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PipeError::ReadTimeout(_)
                | PipeError::FlushTimeout(_)
                | PipeError::MessageReadTimeout(_)
                | PipeError::MessageWriteTimeout(_)
        )
    }

    /// True when the inner pipe was completed by a third party.
    pub fn is_completed_inner(&self) -> bool {
        matches!(self, PipeError::SourceCompleted | PipeError::SinkCompleted)
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        PipeError::Transport(err.into())
    }
}

impl From<std::io::Error> for PipeError {
    fn from(err: std::io::Error) -> Self {
        PipeError::Transport(err.into())
    }
}
