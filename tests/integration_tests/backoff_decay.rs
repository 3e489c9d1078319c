// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result};
use comm_channel_rs::{
    cfg::config::BasicChannelConfig,
    channel::{channel::CommChannel, status::ConnectionAvailability},
    memory::{
        channel_impl::MemoryChannelConfig,
        endpoint::{MemoryEndpoint, MemorySide},
    },
};
use serial_test::serial;
use tokio::time::timeout;

use crate::integration_tests::common::{memory_config, unique_endpoint};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn persistent_failure_decays_to_none_then_recovers() -> Result<()> {
    // The endpoint is never allocated up front: every open attempt fails.
    let endpoint = unique_endpoint("backoff");
    let channel = CommChannel::new(memory_config(
        &endpoint,
        MemorySide::A,
        BasicChannelConfig::default(),
    ))?;
    let mut status = channel.subscribe();

    // Availability decays one step per failed attempt, never repeating a
    // value, until clamped at None.
    let mut seen = Vec::new();
    while seen.last() != Some(&ConnectionAvailability::None) {
        let event = timeout(Duration::from_secs(5), status.recv())
            .await
            .context("no status event before the decay finished")??;
        if let Some(prev) = seen.last() {
            assert_ne!(prev, &event.connection_status, "duplicate emission");
        }
        assert!(
            !event.error_context.is_empty(),
            "degraded events must carry the captured log prologue"
        );
        seen.push(event.connection_status);
    }
    assert_eq!(
        seen,
        vec![
            ConnectionAvailability::Low,
            ConnectionAvailability::DangerZone,
            ConnectionAvailability::None,
        ]
    );

    // The reconnector keeps trying on the back-off schedule; allocating
    // the endpoint lets the next attempt through.
    MemoryEndpoint::allocate(&endpoint)?;
    loop {
        let event = timeout(Duration::from_secs(10), status.recv())
            .await
            .context("the channel never recovered")??;
        if event.connection_status == ConnectionAvailability::Connected {
            assert!(event.error_context.is_empty());
            break;
        }
    }

    channel.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn no_reconnect_without_auto_reconnect() -> Result<()> {
    let endpoint = unique_endpoint("no-auto");
    let basic = BasicChannelConfig {
        auto_reconnect: false,
        ..Default::default()
    };
    let channel = CommChannel::new(std::sync::Arc::new(
        MemoryChannelConfig::new(&endpoint, MemorySide::A).with_basic(basic),
    ))?;
    let mut status = channel.subscribe();

    // One failed attempt, then silence: no reconnector is planned.
    let first = timeout(Duration::from_secs(5), status.recv())
        .await
        .context("the failed open must still emit")??;
    assert_ne!(first.connection_status, ConnectionAvailability::Connected);

    MemoryEndpoint::allocate(&endpoint)?;
    match timeout(Duration::from_millis(600), status.recv()).await {
        // Silence: no reconnector was planned.
        Err(_) => {},
        Ok(Ok(event)) => assert_ne!(
            event.connection_status,
            ConnectionAvailability::Connected,
            "the channel must not reconnect on its own"
        ),
        Ok(Err(_)) => {},
    }

    channel.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}
