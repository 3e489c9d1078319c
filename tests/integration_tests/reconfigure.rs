// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use comm_channel_rs::{
    cfg::config::BasicChannelConfig,
    channel::{channel::CommChannel, status::ConnectionAvailability},
    memory::{
        channel_impl::MemoryChannelConfig,
        endpoint::{MemoryEndpoint, MemorySide},
    },
    pipe::error::PipeError,
};
use tokio::time::timeout;

use crate::integration_tests::common::{
    channel_pair, line_reader, line_writer, memory_config, unique_endpoint,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn knob_only_reconfigure_is_dynamic() -> Result<()> {
    let endpoint = unique_endpoint("reconf-knobs");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;
    assert_eq!(a.connection_status(), ConnectionAvailability::Connected);

    // Same transport, different knobs: applied without a restart.
    let knobs = BasicChannelConfig {
        default_read_timeout_ms: 150,
        ..Default::default()
    };
    a.reconfigure(Arc::new(
        MemoryChannelConfig::new(&endpoint, MemorySide::A).with_basic(knobs),
    ))
    .await?;
    assert_eq!(a.connection_status(), ConnectionAvailability::Connected);

    // The new read timeout is live on the stable reader.
    let err = a
        .reader()
        .read_async(None)
        .await
        .expect_err("the reconfigured timeout must fire");
    assert!(matches!(err, PipeError::ReadTimeout(_)), "got {err}");

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn endpoint_change_restarts_the_transport() -> Result<()> {
    let old_endpoint = unique_endpoint("reconf-old");
    let new_endpoint = unique_endpoint("reconf-new");
    let (a, old_peer) = channel_pair(&old_endpoint, BasicChannelConfig::default())?;

    MemoryEndpoint::allocate(&new_endpoint)?;
    a.reconfigure(memory_config(
        &new_endpoint,
        MemorySide::A,
        BasicChannelConfig::default(),
    ))
    .await?;
    assert_eq!(a.connection_status(), ConnectionAvailability::Connected);

    // Traffic now flows over the new endpoint.
    let peer = CommChannel::new(memory_config(
        &new_endpoint,
        MemorySide::B,
        BasicChannelConfig::default(),
    ))?;
    let writer = line_writer(&peer)?;
    let reader = line_reader(&a)?;
    writer.write(&"over the new endpoint".to_string(), None).await?;
    let message = timeout(Duration::from_secs(5), reader.read_next(None))
        .await
        .context("read timeout")??;
    assert_eq!(message.as_deref(), Some("over the new endpoint"));

    a.dispose().await;
    old_peer.dispose().await;
    peer.dispose().await;
    MemoryEndpoint::remove(&old_endpoint);
    MemoryEndpoint::remove(&new_endpoint);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_reconfigure_is_a_no_op() -> Result<()> {
    let endpoint = unique_endpoint("reconf-noop");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;
    let mut status = a.subscribe();

    a.reconfigure(memory_config(
        &endpoint,
        MemorySide::A,
        BasicChannelConfig::default(),
    ))
    .await?;

    // No status churn: the channel stays Connected and nothing is emitted.
    assert_eq!(a.connection_status(), ConnectionAvailability::Connected);
    assert!(
        timeout(Duration::from_millis(300), status.recv()).await.is_err(),
        "an identical reconfigure must not emit"
    );

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}
