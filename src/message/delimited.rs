// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, ensure};
use bytes::{Bytes, BytesMut};

use crate::message::framing::{DecodeOutcome, MessageDecoder, MessageEncoder};

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        let b = needle[0];
        return haystack.iter().position(|&x| x == b);
    }
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Start-byte/end-sequence framing that survives noisy streams.
///
/// Everything before a start byte is noise and dropped; a fresh start byte
/// inside a half-open frame discards the garbled prefix; end-delimiter
/// bytes in inter-frame noise never produce frames. The `in_message` flag
/// persists across calls, so the invariant "once in a message, the shown
/// buffer begins at the start byte" holds between reads.
///
/// For a single-byte end delimiter the start byte must differ from it; for
/// a multi-byte end the start byte must differ from its last byte, so the
/// start of a frame can never be mistaken for the end anchor.
#[derive(Debug, Clone)]
pub struct DelimitedDecoder {
    start: u8,
    end: Vec<u8>,
    remove_delimiters: bool,
    in_message: bool,
}

impl DelimitedDecoder {
    pub fn new(
        start: u8,
        end: impl AsRef<[u8]>,
        remove_delimiters: bool,
    ) -> Result<Self> {
        let end = end.as_ref().to_vec();
        ensure!(!end.is_empty(), "end delimiter must not be empty");
        let last = *end.last().expect("end delimiter is non-empty");
        ensure!(
            start != last,
            "the start byte must differ from the last end-delimiter byte"
        );
        Ok(Self {
            start,
            end,
            remove_delimiters,
            in_message: false,
        })
    }
}

impl MessageDecoder for DelimitedDecoder {
    type Message = Bytes;

    fn try_decode(&mut self, buf: &[u8]) -> DecodeOutcome {
        let mut base = 0;
        loop {
            let window = &buf[base..];
            if !self.in_message {
                match window.iter().position(|&b| b == self.start) {
                    // Pure noise: drop the whole buffer.
                    None => return DecodeOutcome::NeedMore { consumed: buf.len() },
                    Some(pos) => {
                        base += pos;
                        self.in_message = true;
                    },
                }
                continue;
            }

            // window[0] is the start byte; look for the end just after it.
            let Some(rel) = find(&window[1..], &self.end) else {
                return DecodeOutcome::NeedMore { consumed: base };
            };
            let p_end = 1 + rel;
            let p_after = p_end + self.end.len();

            // A new frame begin inside the half-open frame discards the
            // garbled start.
            let mut frame_start = 0;
            while let Some(next) =
                window[frame_start + 1..p_end].iter().position(|&b| b == self.start)
            {
                frame_start += 1 + next;
            }

            let frame = if self.remove_delimiters {
                Bytes::copy_from_slice(&window[frame_start + 1..p_end])
            } else {
                Bytes::copy_from_slice(&window[frame_start..p_after])
            };
            self.in_message = false;
            return DecodeOutcome::Frame {
                frame,
                consumed: base + p_after,
            };
        }
    }

    fn convert(&mut self, frame: Bytes) -> Result<Bytes> {
        Ok(frame)
    }
}

/// Delimited framing materializing UTF-8 strings.
#[derive(Debug, Clone)]
pub struct StringDelimitedDecoder {
    inner: DelimitedDecoder,
}

impl StringDelimitedDecoder {
    pub fn new(
        start: u8,
        end: impl AsRef<[u8]>,
        remove_delimiters: bool,
    ) -> Result<Self> {
        Ok(Self {
            inner: DelimitedDecoder::new(start, end, remove_delimiters)?,
        })
    }
}

impl MessageDecoder for StringDelimitedDecoder {
    type Message = String;

    fn try_decode(&mut self, buf: &[u8]) -> DecodeOutcome {
        self.inner.try_decode(buf)
    }

    fn convert(&mut self, frame: Bytes) -> Result<String> {
        String::from_utf8(frame.to_vec()).context("frame is not valid UTF-8")
    }
}

/// Writer-side delimited framing: start byte, payload, end delimiter.
///
/// Looser than the reader's constraints: start and end may coincide, since
/// the sender knows exactly where each frame begins.
#[derive(Debug, Clone)]
pub struct DelimitedEncoder {
    start: u8,
    end: Vec<u8>,
}

impl DelimitedEncoder {
    pub fn new(start: u8, end: impl AsRef<[u8]>) -> Result<Self> {
        let end = end.as_ref().to_vec();
        ensure!(!end.is_empty(), "end delimiter must not be empty");
        Ok(Self { start, end })
    }
}

impl MessageEncoder for DelimitedEncoder {
    type Message = Bytes;

    fn encode(&mut self, message: &Bytes, buf: &mut BytesMut) -> Result<bool> {
        buf.extend_from_slice(&[self.start]);
        buf.extend_from_slice(message);
        buf.extend_from_slice(&self.end);
        Ok(true)
    }
}

/// Writer-side delimited framing for strings.
#[derive(Debug, Clone)]
pub struct StringDelimitedEncoder {
    inner: DelimitedEncoder,
}

impl StringDelimitedEncoder {
    pub fn new(start: u8, end: impl AsRef<[u8]>) -> Result<Self> {
        Ok(Self {
            inner: DelimitedEncoder::new(start, end)?,
        })
    }
}

impl MessageEncoder for StringDelimitedEncoder {
    type Message = String;

    fn encode(&mut self, message: &String, buf: &mut BytesMut) -> Result<bool> {
        buf.extend_from_slice(&[self.inner.start]);
        buf.extend_from_slice(message.as_bytes());
        buf.extend_from_slice(&self.inner.end);
        Ok(true)
    }
}
