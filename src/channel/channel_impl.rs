// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    cfg::config::ChannelConfig,
    pipe::{
        behavior::StablePipeBehavior,
        byte_pipe::{ByteSink, ByteSource},
    },
};

/// Everything a transport hands over after a successful open: the byte
/// pipes plus optional behavior overrides for the stable reader/writer.
pub struct OpenedPipes {
    pub source: Arc<dyn ByteSource>,
    pub sink: Arc<dyn ByteSink>,
    pub reader_behavior: Option<Arc<dyn StablePipeBehavior>>,
    pub writer_behavior: Option<Arc<dyn StablePipeBehavior>>,
}

impl OpenedPipes {
    pub fn new(source: Arc<dyn ByteSource>, sink: Arc<dyn ByteSink>) -> Self {
        Self {
            source,
            sink,
            reader_behavior: None,
            writer_behavior: None,
        }
    }
}

/// A transport-specific component that owns the physical connection and
/// produces the byte source/sink pair the channel wires into its stable
/// pipes.
///
/// The impl uniquely owns its transport: the channel disposes it on every
/// teardown (reconfigure-requiring-restart, reconnect, channel shutdown)
/// and materializes a fresh instance through the configuration factory.
#[async_trait]
pub trait ChannelImpl: Send {
    /// Pipes available without an async open (an impl created already
    /// connected). Called once right after construction.
    fn take_open_pipes(&mut self) -> Option<OpenedPipes> {
        None
    }

    /// Opens the transport. Attempted once per impl instance, bounded by
    /// the channel's 5-second deadline; success means returning the pipes.
    async fn initial_open(&mut self, cancel: &CancellationToken)
    -> Result<OpenedPipes>;

    /// Applies a configuration change without closing the transport. No
    /// cancel token: the impl is responsible for its own timeout.
    async fn dynamic_reconfigure(&mut self, config: &dyn ChannelConfig) -> Result<()>;

    /// Releases every transport resource. Must be idempotent.
    async fn dispose(&mut self);
}
