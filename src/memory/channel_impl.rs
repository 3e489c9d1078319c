// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{any::Any, sync::Arc};

use anyhow::{Result, ensure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::{
        BasicChannelConfig, ChannelConfig, Reconfigure, reconfigure_verdict,
    },
    channel::channel_impl::{ChannelImpl, OpenedPipes},
    memory::endpoint::{MemoryEndpoint, MemorySide, MemorySink, MemorySource},
    pipe::byte_pipe::{ByteSink, ByteSource},
};

/// Configuration of a channel over an in-memory endpoint.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct MemoryChannelConfig {
    #[serde(rename = "EndpointName")]
    /// Name in the process-wide endpoint directory.
    pub endpoint_name: String,

    #[serde(rename = "Side")]
    /// Which half of the endpoint this channel claims.
    pub side: MemorySide,

    #[serde(flatten)]
    pub basic: BasicChannelConfig,
}

impl MemoryChannelConfig {
    pub fn new(endpoint_name: impl Into<String>, side: MemorySide) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            side,
            basic: BasicChannelConfig::default(),
        }
    }

    pub fn with_basic(mut self, basic: BasicChannelConfig) -> Self {
        self.basic = basic;
        self
    }
}

impl ChannelConfig for MemoryChannelConfig {
    fn check_valid(&self) -> Result<()> {
        ensure!(
            !self.endpoint_name.is_empty(),
            "EndpointName must not be empty"
        );
        self.basic.check_valid()
    }

    fn basic(&self) -> &BasicChannelConfig {
        &self.basic
    }

    fn can_dynamic_reconfigure_with(&self, other: &dyn ChannelConfig) -> Reconfigure {
        reconfigure_verdict::<Self>(other, |typed| {
            if typed.endpoint_name == self.endpoint_name && typed.side == self.side {
                Reconfigure::Identical
            } else {
                Reconfigure::Restart
            }
        })
    }

    fn create_channel_impl(
        &self,
        can_open_connection: bool,
    ) -> Result<Box<dyn ChannelImpl>> {
        Ok(Box::new(MemoryChannelImpl::new(
            self.clone(),
            can_open_connection,
        )))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn display_name(&self) -> String {
        format!("memory://{}/{}", self.endpoint_name, self.side)
    }
}

/// Transport over an in-memory endpoint.
///
/// Created with `can_open_connection` it claims its side eagerly, so a
/// channel whose endpoint is already allocated connects synchronously at
/// construction; otherwise the claim happens in `initial_open`.
pub struct MemoryChannelImpl {
    config: MemoryChannelConfig,
    attachment: Option<(Arc<MemorySource>, Arc<MemorySink>)>,
    pre_opened: Option<OpenedPipes>,
}

impl MemoryChannelImpl {
    pub fn new(config: MemoryChannelConfig, can_open_connection: bool) -> Self {
        let mut this = Self {
            config,
            attachment: None,
            pre_opened: None,
        };
        if can_open_connection {
            if let Ok(pipes) = this.attach() {
                this.pre_opened = Some(pipes);
            }
        }
        this
    }

    fn attach(&mut self) -> Result<OpenedPipes> {
        let (source, sink) =
            MemoryEndpoint::attach(&self.config.endpoint_name, self.config.side)?;
        self.attachment = Some((source.clone(), sink.clone()));
        Ok(OpenedPipes::new(source, sink))
    }

    fn detach(&mut self) {
        if let Some((source, sink)) = self.attachment.take() {
            source.complete();
            sink.complete();
        }
    }
}

#[async_trait]
impl ChannelImpl for MemoryChannelImpl {
    fn take_open_pipes(&mut self) -> Option<OpenedPipes> {
        self.pre_opened.take()
    }

    async fn initial_open(
        &mut self,
        _cancel: &CancellationToken,
    ) -> Result<OpenedPipes> {
        self.detach();
        self.attach()
    }

    async fn dynamic_reconfigure(&mut self, _config: &dyn ChannelConfig) -> Result<()> {
        // Only the generic knobs are dynamic for this transport; they are
        // applied by the channel itself.
        Ok(())
    }

    async fn dispose(&mut self) {
        debug!(
            "disposing memory transport for endpoint '{}'",
            self.config.endpoint_name
        );
        self.detach();
        self.pre_opened = None;
    }
}

impl Drop for MemoryChannelImpl {
    fn drop(&mut self) {
        self.detach();
    }
}
