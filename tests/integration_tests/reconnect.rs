// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use comm_channel_rs::{
    cfg::config::BasicChannelConfig, memory::endpoint::MemoryEndpoint,
};
use rand::RngExt;
use serial_test::serial;
use tokio::time::{sleep, timeout};

use crate::integration_tests::common::{channel_pair, line_reader, line_writer, unique_endpoint};

const MESSAGES: usize = 40;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn survives_endpoint_reallocation_without_loss_or_duplication() -> Result<()> {
    let endpoint = unique_endpoint("reconnect");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;

    let mut status_events = 0usize;
    let mut status = a.subscribe();

    // Background chaos: periodically deallocate and re-allocate the
    // endpoint while messages are in flight.
    let stop_chaos = Arc::new(AtomicBool::new(false));
    let chaos = {
        let endpoint = endpoint.clone();
        let stop = stop_chaos.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                // A fresh thread-local rng per draw: it must not be held
                // across an await.
                let pause = rand::rng().random_range(30..=80);
                sleep(Duration::from_millis(pause)).await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                MemoryEndpoint::deallocate(&endpoint);
                let outage = rand::rng().random_range(10..=40);
                sleep(Duration::from_millis(outage)).await;
                let _ = MemoryEndpoint::allocate(&endpoint);
            }
            // Leave the endpoint allocated so stragglers can finish.
            let _ = MemoryEndpoint::allocate(&endpoint);
        })
    };

    let writer_a = line_writer(&a)?;
    let reader_a = line_reader(&a)?;
    let writer_b = line_writer(&b)?;
    let reader_b = line_reader(&b)?;

    let send_a = tokio::spawn(async move {
        for n in 0..MESSAGES {
            writer_a
                .write(&format!("Message {n}"), None)
                .await
                .context("a->b write failed")?;
            sleep(Duration::from_millis(5)).await;
        }
        // A flush raced by a teardown may return canceled with the frame
        // still buffered; drain before declaring the side done.
        while writer_a.stable_writer().pending_len() > 0 {
            let _ = writer_a.stable_writer().flush_async(None).await;
            sleep(Duration::from_millis(10)).await;
        }
        anyhow::Ok(())
    });
    let send_b = tokio::spawn(async move {
        for n in 0..MESSAGES {
            writer_b
                .write(&format!("Message {n}"), None)
                .await
                .context("b->a write failed")?;
            sleep(Duration::from_millis(5)).await;
        }
        while writer_b.stable_writer().pending_len() > 0 {
            let _ = writer_b.stable_writer().flush_async(None).await;
            sleep(Duration::from_millis(10)).await;
        }
        anyhow::Ok(())
    });

    let recv_b = tokio::spawn(async move {
        let mut got = Vec::new();
        while got.len() < MESSAGES {
            if let Some(message) = reader_b.read_next(None).await? {
                got.push(message);
            }
        }
        anyhow::Ok(got)
    });
    let recv_a = tokio::spawn(async move {
        let mut got = Vec::new();
        while got.len() < MESSAGES {
            if let Some(message) = reader_a.read_next(None).await? {
                got.push(message);
            }
        }
        anyhow::Ok(got)
    });

    let deadline = Duration::from_secs(60);
    timeout(deadline, send_a).await.context("a->b send stalled")???;
    timeout(deadline, send_b).await.context("b->a send stalled")???;
    let got_b = timeout(deadline, recv_b).await.context("b receive stalled")???;
    let got_a = timeout(deadline, recv_a).await.context("a receive stalled")???;

    stop_chaos.store(true, Ordering::SeqCst);
    let _ = chaos.await;

    for (direction, got) in [("a->b", &got_b), ("b->a", &got_a)] {
        assert_eq!(got.len(), MESSAGES, "{direction}: wrong message count");
        let unique: HashSet<&String> = got.iter().collect();
        assert_eq!(unique.len(), MESSAGES, "{direction}: duplicated message");
        for (n, message) in got.iter().enumerate() {
            assert_eq!(
                message,
                &format!("Message {n}"),
                "{direction}: out of order at {n}"
            );
        }
    }

    while let Ok(event) = status.try_recv() {
        let _ = event;
        status_events += 1;
    }
    assert!(
        status_events >= 1,
        "the outages must surface as status changes"
    );

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}
