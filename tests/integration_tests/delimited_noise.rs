// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use comm_channel_rs::{
    cfg::config::BasicChannelConfig,
    memory::endpoint::MemoryEndpoint,
    message::{delimited::StringDelimitedDecoder, reader::MessageReader},
};
use tokio::time::timeout;

use crate::integration_tests::common::{channel_pair, unique_endpoint};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn noise_yields_exactly_two_frames() -> Result<()> {
    let endpoint = unique_endpoint("delimited-noise");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;

    let reader = MessageReader::new(
        b.reader(),
        StringDelimitedDecoder::new(b'#', b";", true)?,
    );

    // Raw bytes with half-open frames and stray delimiters; pushed in two
    // chunks so a frame straddles the read boundary.
    let writer = a.writer();
    writer.write_bytes(b" garbage #Message 0; other garbage... g#a#rb");
    writer.flush_async(None).await?;
    writer.write_bytes(b"age# #Message 1; ;other garbage;...;");
    writer.flush_async(None).await?;

    let first = timeout(Duration::from_secs(5), reader.read_next(None))
        .await
        .context("read timeout")??;
    assert_eq!(first.as_deref(), Some("Message 0"));

    let second = timeout(Duration::from_secs(5), reader.read_next(None))
        .await
        .context("read timeout")??;
    assert_eq!(second.as_deref(), Some("Message 1"));

    // Nothing else: the trailing noise must not frame. A short timeout
    // bounds the probe.
    let probe = reader
        .read_next_timeout(None, Some(Duration::from_millis(100)))
        .await;
    assert!(probe.is_err(), "noise after the last frame framed: {probe:?}");

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}
