// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use comm_channel_rs::{
    cfg::config::BasicChannelConfig,
    memory::endpoint::MemoryEndpoint,
    message::handler::{
        MessageHandler, MessageHandlerHooks, MessageHandlerOptions, StopReason,
    },
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::integration_tests::common::{channel_pair, line_reader, line_writer, unique_endpoint};

struct Collector {
    seen: Arc<Mutex<Vec<String>>>,
    stop_after: Option<usize>,
}

#[async_trait]
impl MessageHandlerHooks<String> for Collector {
    async fn handle_message(
        &mut self,
        message: Option<String>,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        if let Some(message) = message {
            let mut seen = self.seen.lock().expect("seen lock poisoned");
            seen.push(message);
            if self.stop_after.is_some_and(|limit| seen.len() >= limit) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stops_after_the_message_budget() -> Result<()> {
    let endpoint = unique_endpoint("handler-max");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;
    let writer = line_writer(&a)?;
    let reader = Arc::new(line_reader(&b)?);

    let handler = Arc::new(MessageHandler::new(
        reader,
        MessageHandlerOptions::default(),
    ));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut stopped = handler.stopped_reason();

    assert!(handler.clone().start(
        Collector {
            seen: seen.clone(),
            stop_after: None,
        },
        Some(3),
    ));
    // A second start while running must be refused.
    assert!(!handler.clone().start(
        Collector {
            seen: seen.clone(),
            stop_after: None,
        },
        None,
    ));

    for n in 0..5 {
        writer.write(&format!("Message {n}"), None).await?;
    }

    timeout(Duration::from_secs(5), stopped.changed())
        .await
        .context("the loop never stopped")??;
    assert_eq!(*stopped.borrow(), StopReason::MaxMessageNumber);
    assert_eq!(
        seen.lock().expect("seen lock poisoned").as_slice(),
        &["Message 0", "Message 1", "Message 2"]
    );
    assert!(!handler.is_running());

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callback_refusal_stops_the_loop() -> Result<()> {
    let endpoint = unique_endpoint("handler-refuse");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;
    let writer = line_writer(&a)?;
    let reader = Arc::new(line_reader(&b)?);

    let handler = Arc::new(MessageHandler::new(
        reader,
        MessageHandlerOptions::default(),
    ));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut stopped = handler.stopped_reason();

    handler.clone().start(
        Collector {
            seen: seen.clone(),
            stop_after: Some(2),
        },
        None,
    );

    for n in 0..4 {
        writer.write(&format!("Message {n}"), None).await?;
    }

    timeout(Duration::from_secs(5), stopped.changed())
        .await
        .context("the loop never stopped")??;
    assert_eq!(*stopped.borrow(), StopReason::ProcessMessage);
    assert_eq!(seen.lock().expect("seen lock poisoned").len(), 2);

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reader_completion_stops_the_loop() -> Result<()> {
    let endpoint = unique_endpoint("handler-complete");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;
    let writer = line_writer(&a)?;
    let reader = Arc::new(line_reader(&b)?);

    let handler = Arc::new(MessageHandler::new(
        reader,
        MessageHandlerOptions::default(),
    ));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut stopped = handler.stopped_reason();

    handler.clone().start(
        Collector {
            seen: seen.clone(),
            stop_after: None,
        },
        None,
    );

    writer.write(&"only one".to_string(), None).await?;
    // Give the loop a moment to drain, then terminate the reader's side.
    tokio::time::sleep(Duration::from_millis(100)).await;
    b.dispose().await;

    timeout(Duration::from_secs(5), stopped.changed())
        .await
        .context("the loop never stopped")??;
    assert_eq!(*stopped.borrow(), StopReason::OnReaderComplete);
    assert_eq!(
        seen.lock().expect("seen lock poisoned").as_slice(),
        &["only one"]
    );

    a.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_stop_interrupts_a_blocked_read() -> Result<()> {
    let endpoint = unique_endpoint("handler-stop");
    let (a, b) = channel_pair(&endpoint, BasicChannelConfig::default())?;
    let reader = Arc::new(line_reader(&b)?);

    let handler = Arc::new(MessageHandler::new(
        reader,
        MessageHandlerOptions::default(),
    ));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut stopped = handler.stopped_reason();

    handler.clone().start(
        Collector {
            seen: seen.clone(),
            stop_after: None,
        },
        None,
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handler.stop(true));

    timeout(Duration::from_secs(5), stopped.changed())
        .await
        .context("the loop never stopped")??;
    assert_eq!(*stopped.borrow(), StopReason::StoppedLoop);
    assert!(seen.lock().expect("seen lock poisoned").is_empty());

    a.dispose().await;
    b.dispose().await;
    MemoryEndpoint::remove(&endpoint);
    Ok(())
}
