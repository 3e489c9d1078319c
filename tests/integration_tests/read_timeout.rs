// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use comm_channel_rs::{
    cfg::config::BasicChannelConfig, memory::endpoint::MemoryEndpoint,
    pipe::error::PipeError,
};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{channel_pair, line_writer, unique_endpoint};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_read_times_out_then_external_cancel_wins() -> Result<()> {
    let endpoint = unique_endpoint("read-timeout");
    let basic = BasicChannelConfig {
        default_read_timeout_ms: 100,
        ..Default::default()
    };
    let (a, b) = channel_pair(&endpoint, basic)?;
    let reader = b.reader();

    // No cancel token: the internal 100ms timeout fires and surfaces.
    let started = Instant::now();
    let err = reader
        .read_async(None)
        .await
        .expect_err("an idle read must time out");
    let elapsed = started.elapsed();
    assert!(matches!(err, PipeError::ReadTimeout(_)), "got {err}");
    assert!(
        elapsed >= Duration::from_millis(90) && elapsed <= Duration::from_millis(500),
        "timed out after {elapsed:?}"
    );

    // With a caller token the internal timeout is off; a frame written
    // before the token fires is delivered.
    let writer = line_writer(&a)?;
    tokio::spawn(async move {
        sleep(Duration::from_millis(280)).await;
        let _ = writer.write(&"late frame".to_string(), None).await;
    });

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let result = timeout(Duration::from_secs(5), reader.read_async(Some(&token)))
        .await
        .context("read timeout")??;
    assert!(!result.is_completed);
    assert!(!result.is_canceled);
    assert!(!result.buffer.is_empty());

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caller_cancel_propagates_unchanged() -> Result<()> {
    let endpoint = unique_endpoint("caller-cancel");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;
    let reader = b.reader();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = reader
        .read_async(Some(&token))
        .await
        .expect_err("the caller's cancel must propagate");
    assert!(matches!(err, PipeError::Canceled), "got {err}");

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}
