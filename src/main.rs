// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use comm_channel_rs::{
    cfg::logger::init_logger,
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
use tokio::time::sleep;
use tracing::info;

const ENDPOINT: &str = "demo-endpoint";
const DELIMITER: &str = "\r\n";

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("tests/config_logger.yaml")?;

    MemoryEndpoint::allocate(ENDPOINT)?;

    let left = CommChannel::new(Arc::new(MemoryChannelConfig::new(
        ENDPOINT,
        MemorySide::A,
    )))
    .context("failed to create the left channel")?;
    let right = CommChannel::new(Arc::new(MemoryChannelConfig::new(
        ENDPOINT,
        MemorySide::B,
    )))
    .context("failed to create the right channel")?;

    // Watch the left channel's availability while the endpoint flaps.
    let mut status = left.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            info!(
                "channel#{} -> {} ({} captured log entries)",
                event.channel,
                event.connection_status,
                event.error_context.len()
            );
        }
    });

    let writer = MessageWriter::new(
        left.writer(),
        StringLineEncoder::new(DELIMITER)?,
    );
    let reader = MessageReader::new(
        right.reader(),
        StringLineDecoder::new(DELIMITER)?,
    );

    for n in 0..5 {
        writer.write(&format!("Message {n}"), None).await?;
    }
    for _ in 0..5 {
        if let Some(message) = reader.read_next(None).await? {
            info!("received: {message}");
        }
    }

    // Pull the endpoint out from under both channels; auto-reconnect
    // picks it back up once it is re-allocated.
    info!("deallocating the endpoint");
    MemoryEndpoint::deallocate(ENDPOINT);
    sleep(Duration::from_millis(200)).await;
    MemoryEndpoint::allocate(ENDPOINT)?;

    writer.write(&"Message after the outage".to_string(), None).await?;
    if let Some(message) = reader.read_next(None).await? {
        info!("received after the outage: {message}");
    }

    left.dispose().await;
    right.dispose().await;
    MemoryEndpoint::remove(ENDPOINT);

    Ok(())
}
