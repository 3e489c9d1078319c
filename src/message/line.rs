// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, ensure};
use bytes::{Bytes, BytesMut};

use crate::message::framing::{DecodeOutcome, MessageDecoder, MessageEncoder};

/// Finds the first occurrence of `needle` in `haystack`.
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

/// Line framing: every frame is terminated by a fixed non-empty delimiter.
///
/// A delimiter split across two reads is still detected because undecoded
/// bytes stay staged in the source until the tail arrives.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    delimiter: Vec<u8>,
}

impl LineDecoder {
    pub fn new(delimiter: impl AsRef<[u8]>) -> Result<Self> {
        let delimiter = delimiter.as_ref().to_vec();
        ensure!(!delimiter.is_empty(), "line delimiter must not be empty");
        Ok(Self { delimiter })
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }
}

impl MessageDecoder for LineDecoder {
    type Message = Bytes;

    fn try_decode(&mut self, buf: &[u8]) -> DecodeOutcome {
        match find(buf, &self.delimiter) {
            Some(pos) => DecodeOutcome::Frame {
                frame: Bytes::copy_from_slice(&buf[..pos]),
                consumed: pos + self.delimiter.len(),
            },
            None => DecodeOutcome::NeedMore { consumed: 0 },
        }
    }

    fn convert(&mut self, frame: Bytes) -> Result<Bytes> {
        Ok(frame)
    }
}

/// Line framing materializing UTF-8 strings. An empty string is a valid
/// frame, distinct from the reader's "no message" sentinel.
#[derive(Debug, Clone)]
pub struct StringLineDecoder {
    inner: LineDecoder,
}

impl StringLineDecoder {
    pub fn new(delimiter: impl AsRef<[u8]>) -> Result<Self> {
        Ok(Self {
            inner: LineDecoder::new(delimiter)?,
        })
    }
}

impl MessageDecoder for StringLineDecoder {
    type Message = String;

    fn try_decode(&mut self, buf: &[u8]) -> DecodeOutcome {
        self.inner.try_decode(buf)
    }

    fn convert(&mut self, frame: Bytes) -> Result<String> {
        String::from_utf8(frame.to_vec()).context("frame is not valid UTF-8")
    }
}

/// Writer-side line framing: payload bytes plus the fixed delimiter.
#[derive(Debug, Clone)]
pub struct LineEncoder {
    delimiter: Vec<u8>,
}

impl LineEncoder {
    pub fn new(delimiter: impl AsRef<[u8]>) -> Result<Self> {
        let delimiter = delimiter.as_ref().to_vec();
        ensure!(!delimiter.is_empty(), "line delimiter must not be empty");
        Ok(Self { delimiter })
    }
}

impl MessageEncoder for LineEncoder {
    type Message = Bytes;

    fn encode(&mut self, message: &Bytes, buf: &mut BytesMut) -> Result<bool> {
        buf.extend_from_slice(message);
        buf.extend_from_slice(&self.delimiter);
        Ok(true)
    }
}

/// Writer-side line framing for strings.
#[derive(Debug, Clone)]
pub struct StringLineEncoder {
    inner: LineEncoder,
}

impl StringLineEncoder {
    pub fn new(delimiter: impl AsRef<[u8]>) -> Result<Self> {
        Ok(Self {
            inner: LineEncoder::new(delimiter)?,
        })
    }
}

impl MessageEncoder for StringLineEncoder {
    type Message = String;

    fn encode(&mut self, message: &String, buf: &mut BytesMut) -> Result<bool> {
        buf.extend_from_slice(message.as_bytes());
        buf.extend_from_slice(&self.inner.delimiter);
        Ok(true)
    }
}
