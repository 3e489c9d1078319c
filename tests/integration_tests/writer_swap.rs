// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use comm_channel_rs::pipe::{
    byte_pipe::ByteSink,
    error::PipeError,
    result::FlushResult,
    stable_reader::StableReader,
    stable_writer::StableWriter,
    stream::StreamSource,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Accepts writes but never completes a flush.
struct HangingSink;

#[async_trait]
impl ByteSink for HangingSink {
    async fn write(
        &self,
        _data: &[u8],
        _cancel: Option<&CancellationToken>,
    ) -> Result<(), PipeError> {
        Ok(())
    }

    async fn flush(
        &self,
        _cancel: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError> {
        std::future::pending().await
    }

    fn cancel_pending_flush(&self) {}

    fn complete(&self) {}
}

/// Records every flushed byte run.
#[derive(Default)]
struct CollectingSink {
    staged: Mutex<Vec<u8>>,
    flushes: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl ByteSink for CollectingSink {
    async fn write(
        &self,
        data: &[u8],
        _cancel: Option<&CancellationToken>,
    ) -> Result<(), PipeError> {
        self.staged
            .lock()
            .expect("staged lock poisoned")
            .extend_from_slice(data);
        Ok(())
    }

    async fn flush(
        &self,
        _cancel: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError> {
        let staged = std::mem::take(
            &mut *self.staged.lock().expect("staged lock poisoned"),
        );
        self.flushes
            .lock()
            .expect("flushes lock poisoned")
            .push(staged);
        Ok(FlushResult::done())
    }

    fn cancel_pending_flush(&self) {}

    fn complete(&self) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_preserves_the_buffer_and_the_next_sink_gets_it_once() -> Result<()> {
    let writer = StableWriter::new();
    writer.set_default_timeout(Some(Duration::from_millis(50)));

    writer.set_inner(Arc::new(HangingSink), false);
    writer.write_bytes(b"payload");

    // The flush times out; the default behavior throws; the buffer stays.
    let err = writer
        .flush_async(None)
        .await
        .expect_err("the hanging sink must time out");
    assert!(matches!(err, PipeError::FlushTimeout(_)), "got {err}");
    assert_eq!(writer.pending_len(), 7);

    // A working sink receives the original bytes exactly once.
    let collector = Arc::new(CollectingSink::default());
    let written: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
    let written_probe = written.clone();
    writer.on_data_written(move |bytes| {
        written_probe
            .lock()
            .expect("event lock poisoned")
            .push(bytes.clone());
    });

    writer.set_inner(collector.clone(), false);
    let result = writer.flush_async(None).await?;
    assert!(!result.is_canceled && !result.is_completed);
    assert_eq!(writer.pending_len(), 0);

    let flushes = collector.flushes.lock().expect("flushes lock poisoned");
    assert_eq!(flushes.as_slice(), &[b"payload".to_vec()]);
    let events = written.lock().expect("event lock poisoned");
    assert_eq!(events.len(), 1);
    assert_eq!(&events[0][..], b"payload");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_on_the_same_sink_does_not_redeliver() -> Result<()> {
    let writer = StableWriter::new();
    let collector = Arc::new(CollectingSink::default());

    writer.set_inner(collector.clone(), false);
    writer.write_bytes(b"frame one");
    writer.flush_async(None).await?;

    // Re-setting the same sink only updates the completion request; the
    // delivered position survives, so nothing is re-sent.
    writer.set_inner(collector.clone(), false);
    writer.write_bytes(b"frame two");
    writer.flush_async(None).await?;

    let flushes = collector.flushes.lock().expect("flushes lock poisoned");
    assert_eq!(
        flushes.as_slice(),
        &[b"frame one".to_vec(), b"frame two".to_vec()]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn advance_after_swap_is_a_no_op() -> Result<()> {
    let reader = StableReader::new();

    let (client_one, mut server_one) = tokio::io::duplex(256);
    let source_one = Arc::new(StreamSource::new(client_one));
    reader.set_inner(source_one, false);

    server_one.write_all(b"first source bytes").await?;
    let result = reader.read_async(None).await?;
    assert_eq!(&result.buffer[..], b"first source bytes");

    // Swap before advancing: the advance still lands on the retained
    // source without an error or state corruption.
    let (client_two, mut server_two) = tokio::io::duplex(256);
    let source_two = Arc::new(StreamSource::new(client_two));
    reader.set_inner(source_two, false);

    reader.advance_to(5, 18)?;

    server_two.write_all(b"second").await?;
    let result = reader.read_async(None).await?;
    assert_eq!(&result.buffer[..], b"second");
    Ok(())
}
