// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use comm_channel_rs::cfg::config::BasicChannelConfig;
use comm_channel_rs::channel::status::ConnectionAvailability;
use comm_channel_rs::memory::endpoint::MemoryEndpoint;
use tokio::time::timeout;

use crate::integration_tests::common::{channel_pair, line_reader, line_writer, unique_endpoint};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn five_messages_in_order() -> Result<()> {
    let endpoint = unique_endpoint("roundtrip");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;
    assert_eq!(a.connection_status(), ConnectionAvailability::Connected);
    assert_eq!(b.connection_status(), ConnectionAvailability::Connected);

    let writer = line_writer(&a)?;
    let reader = line_reader(&b)?;

    for n in 1..=5 {
        let sent = timeout(
            Duration::from_secs(5),
            writer.write(&format!("Message {n}"), None),
        )
        .await
        .context("write timeout")??;
        assert!(sent);
    }

    for n in 1..=5 {
        let message = timeout(Duration::from_secs(5), reader.read_next(None))
            .await
            .context("read timeout")??;
        assert_eq!(message.as_deref(), Some(format!("Message {n}").as_str()));
    }
    assert!(!reader.is_completed());

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_directions_at_once() -> Result<()> {
    let endpoint = unique_endpoint("duplex");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;

    let writer_a = line_writer(&a)?;
    let reader_a = line_reader(&a)?;
    let writer_b = line_writer(&b)?;
    let reader_b = line_reader(&b)?;

    for n in 0..10 {
        writer_a.write(&format!("a->{n}"), None).await?;
        writer_b.write(&format!("b->{n}"), None).await?;
    }
    for n in 0..10 {
        let from_a = timeout(Duration::from_secs(5), reader_b.read_next(None))
            .await
            .context("read timeout")??;
        assert_eq!(from_a.as_deref(), Some(format!("a->{n}").as_str()));
        let from_b = timeout(Duration::from_secs(5), reader_a.read_next(None))
            .await
            .context("read timeout")??;
        assert_eq!(from_b.as_deref(), Some(format!("b->{n}").as_str()));
    }

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}
