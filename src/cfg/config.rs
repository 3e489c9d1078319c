// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{any::Any, sync::Arc, time::Duration};

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::channel::channel_impl::ChannelImpl;

/// Generic knobs every channel configuration carries, independent of the
/// transport behind it. Changing only these knobs never requires a
/// transport restart.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BasicChannelConfig {
    #[serde(default = "timeout_disabled", rename = "DefaultReadTimeoutMs")]
    /// Internal read timeout in milliseconds; `<= 0` disables it.
    pub default_read_timeout_ms: i64,

    #[serde(default = "timeout_disabled", rename = "DefaultWriteTimeoutMs")]
    /// Internal flush timeout in milliseconds; `<= 0` disables it.
    pub default_write_timeout_ms: i64,

    #[serde(default, rename = "DefaultRetryWriteCount")]
    /// Additional flush attempts on timeout. Effective only when the write
    /// timeout is enabled.
    pub default_retry_write_count: u32,

    #[serde(default = "default_true", rename = "AutoReconnect")]
    /// Whether the channel keeps reopening its transport after failures.
    pub auto_reconnect: bool,
}

fn timeout_disabled() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

impl Default for BasicChannelConfig {
    fn default() -> Self {
        Self {
            default_read_timeout_ms: timeout_disabled(),
            default_write_timeout_ms: timeout_disabled(),
            default_retry_write_count: 0,
            auto_reconnect: true,
        }
    }
}

impl BasicChannelConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.default_read_timeout_ms > 0)
            .then(|| Duration::from_millis(self.default_read_timeout_ms as u64))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.default_write_timeout_ms > 0)
            .then(|| Duration::from_millis(self.default_write_timeout_ms as u64))
    }

    /// Retry count as it becomes effective (zero without a write timeout).
    pub fn effective_retry_write_count(&self) -> u32 {
        if self.write_timeout().is_some() {
            self.default_retry_write_count
        } else {
            0
        }
    }

    pub fn check_valid(&self) -> Result<()> {
        ensure!(
            self.default_retry_write_count <= 100,
            "DefaultRetryWriteCount must be <= 100"
        );
        Ok(())
    }
}

/// Verdict of comparing two configurations for reconfiguration purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconfigure {
    /// The configurations are identical; reconfiguring is a no-op.
    Identical,
    /// The transport can absorb the change without closing.
    Dynamic,
    /// The transport must be torn down and reopened.
    Restart,
}

/// A channel configuration: validation, reconfiguration comparison, the
/// generic knobs, and the factory for the transport it describes.
pub trait ChannelConfig: Send + Sync + 'static {
    /// Validates the configuration. Called at channel create and
    /// reconfigure time; a failure here surfaces as a configuration error
    /// to the caller.
    fn check_valid(&self) -> Result<()>;

    /// The generic knobs shared by every transport.
    fn basic(&self) -> &BasicChannelConfig;

    /// Compares the transport-specific parts of `self` and `other`.
    ///
    /// Implementations ignore the generic knobs here: the channel upgrades
    /// an `Identical` verdict to `Dynamic` on its own when only the knobs
    /// differ.
    fn can_dynamic_reconfigure_with(&self, other: &dyn ChannelConfig) -> Reconfigure;

    /// Produces the transport. With `can_open_connection == false` the
    /// returned impl must be an unopened instance (used to pre-stage a
    /// clean target for the next reopen).
    fn create_channel_impl(
        &self,
        can_open_connection: bool,
    ) -> Result<Box<dyn ChannelImpl>>;

    /// Downcast support for `can_dynamic_reconfigure_with` implementations.
    fn as_any(&self) -> &dyn Any;

    /// Short human-readable description used in logs.
    fn display_name(&self) -> String;
}

/// Compares two configurations the way most transports need it: downcast
/// `other` to `C`, report `Restart` on a type mismatch, and let `compare`
/// judge the transport-specific fields.
pub fn reconfigure_verdict<C: ChannelConfig>(
    other: &dyn ChannelConfig,
    compare: impl FnOnce(&C) -> Reconfigure,
) -> Reconfigure {
    match other.as_any().downcast_ref::<C>() {
        Some(typed) => compare(typed),
        None => Reconfigure::Restart,
    }
}

/// Convenience alias used throughout the channel layer.
pub type SharedConfig = Arc<dyn ChannelConfig>;
