// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::{Bytes, BytesMut};

/// What a decoder made of the bytes it was shown.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// One complete frame was isolated. `consumed` is how many leading
    /// bytes of the shown buffer the frame (plus any discarded noise and
    /// delimiters) used up.
    Frame { frame: Bytes, consumed: usize },
    /// No complete frame yet. `consumed` leading bytes were recognized as
    /// noise and may be dropped; everything else must be kept and shown
    /// again once more data arrives.
    NeedMore { consumed: usize },
}

/// Framing plus materialization for a pull-based message reader.
///
/// `try_decode` is called with a snapshot of all staged bytes and may keep
/// state across calls (a frame may straddle reads). `convert` turns an
/// isolated frame into the caller-visible message; its errors are the
/// caller's problem, not communication faults.
pub trait MessageDecoder: Send {
    type Message;

    fn try_decode(&mut self, buf: &[u8]) -> DecodeOutcome;

    fn convert(&mut self, frame: Bytes) -> Result<Self::Message>;
}

/// Frame formatting for a message writer: one frame appended to `buf` per
/// call. Returning `Ok(false)` aborts the send (the writer rolls the
/// buffer back and reports an unsent message).
pub trait MessageEncoder: Send {
    type Message;

    fn encode(&mut self, message: &Self::Message, buf: &mut BytesMut) -> Result<bool>;
}
