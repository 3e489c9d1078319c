// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Result;
use comm_channel_rs::{
    cfg::config::BasicChannelConfig,
    channel::channel::CommChannel,
    memory::{
        channel_impl::MemoryChannelConfig,
        endpoint::{MemoryEndpoint, MemorySide},
    },
    message::{
        line::{StringLineDecoder, StringLineEncoder},
        reader::MessageReader,
        writer::MessageWriter,
    },
};

pub const DELIMITER: &str = "\r\n";

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(0);

/// A fresh endpoint name so tests sharing the process-wide directory do
/// not step on each other.
pub fn unique_endpoint(prefix: &str) -> String {
    let n = NEXT_ENDPOINT.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}-{n}")
}

pub fn memory_config(
    endpoint: &str,
    side: MemorySide,
    basic: BasicChannelConfig,
) -> Arc<MemoryChannelConfig> {
    Arc::new(MemoryChannelConfig::new(endpoint, side).with_basic(basic))
}

/// Allocates `endpoint` and opens the two channels attached to its sides.
pub fn channel_pair(
    endpoint: &str,
    basic: BasicChannelConfig,
) -> Result<(CommChannel, CommChannel)> {
    MemoryEndpoint::allocate(endpoint)?;
    let a = CommChannel::new(memory_config(endpoint, MemorySide::A, basic.clone()))?;
    let b = CommChannel::new(memory_config(endpoint, MemorySide::B, basic))?;
    Ok((a, b))
}

pub fn line_writer(
    channel: &CommChannel,
) -> Result<MessageWriter<StringLineEncoder>> {
    Ok(MessageWriter::new(
        channel.writer(),
        StringLineEncoder::new(DELIMITER)?,
    ))
}

pub fn line_reader(
    channel: &CommChannel,
) -> Result<MessageReader<StringLineDecoder>> {
    Ok(MessageReader::new(
        channel.reader(),
        StringLineDecoder::new(DELIMITER)?,
    ))
}
