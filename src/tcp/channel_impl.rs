// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{any::Any, sync::Arc};

use anyhow::{Context, Result, bail, ensure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{
    TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::config::{
        BasicChannelConfig, ChannelConfig, Reconfigure, reconfigure_verdict,
    },
    channel::channel_impl::{ChannelImpl, OpenedPipes},
    pipe::{
        byte_pipe::{ByteSink, ByteSource},
        stream::{StreamSink, StreamSource},
    },
};

fn default_true() -> bool {
    true
}

/// Configuration of a channel over a TCP connection.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TcpChannelConfig {
    #[serde(rename = "Host")]
    pub host: String,

    #[serde(rename = "Port")]
    pub port: u16,

    #[serde(default = "default_true", rename = "NoDelay")]
    /// Disables Nagle's algorithm on the connected socket.
    pub no_delay: bool,

    #[serde(flatten)]
    pub basic: BasicChannelConfig,
}

impl TcpChannelConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            no_delay: true,
            basic: BasicChannelConfig::default(),
        }
    }

    pub fn with_basic(mut self, basic: BasicChannelConfig) -> Self {
        self.basic = basic;
        self
    }
}

impl ChannelConfig for TcpChannelConfig {
    fn check_valid(&self) -> Result<()> {
        ensure!(!self.host.is_empty(), "Host must not be empty");
        ensure!(self.port != 0, "Port must not be 0");
        self.basic.check_valid()
    }

    fn basic(&self) -> &BasicChannelConfig {
        &self.basic
    }

    fn can_dynamic_reconfigure_with(&self, other: &dyn ChannelConfig) -> Reconfigure {
        reconfigure_verdict::<Self>(other, |typed| {
            if typed.host == self.host
                && typed.port == self.port
                && typed.no_delay == self.no_delay
            {
                Reconfigure::Identical
            } else {
                Reconfigure::Restart
            }
        })
    }

    fn create_channel_impl(
        &self,
        _can_open_connection: bool,
    ) -> Result<Box<dyn ChannelImpl>> {
        Ok(Box::new(TcpChannelImpl::new(self.clone())))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn display_name(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Transport over a TCP connection: connect, tune the socket, split the
/// stream, and hand the halves over as stream-backed pipes.
pub struct TcpChannelImpl {
    config: TcpChannelConfig,
    pipes: Option<(Arc<StreamSource<OwnedReadHalf>>, Arc<StreamSink<OwnedWriteHalf>>)>,
}

impl TcpChannelImpl {
    pub fn new(config: TcpChannelConfig) -> Self {
        Self {
            config,
            pipes: None,
        }
    }
}

#[async_trait]
impl ChannelImpl for TcpChannelImpl {
    async fn initial_open(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<OpenedPipes> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = tokio::select! {
            _ = cancel.cancelled() => bail!("connect to {addr} canceled"),
            res = TcpStream::connect(&addr) => {
                res.with_context(|| format!("failed to connect to {addr}"))?
            },
        };
        stream.set_linger(None)?;
        stream.set_nodelay(self.config.no_delay)?;

        let (r, w) = stream.into_split();
        let source = Arc::new(StreamSource::new(r));
        let sink = Arc::new(StreamSink::new(w));
        self.pipes = Some((source.clone(), sink.clone()));
        debug!("tcp transport connected to {addr}");
        Ok(OpenedPipes::new(source, sink))
    }

    async fn dynamic_reconfigure(&mut self, _config: &dyn ChannelConfig) -> Result<()> {
        // Address or socket-option changes demand a restart; nothing else
        // is transport-level here.
        Ok(())
    }

    async fn dispose(&mut self) {
        if let Some((source, sink)) = self.pipes.take() {
            source.complete();
            sink.complete();
        }
    }
}
