// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{RwLock, Weak};

use tracing::debug;

use crate::{
    channel::channel::ChannelShared,
    pipe::{
        behavior::{CompletionAction, ErrorAction, StablePipeBehavior},
        error::PipeError,
    },
};

/// Which stable pipe this wrapper is installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSide {
    Reader,
    Writer,
}

impl PipeSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PipeSide::Reader => "reader",
            PipeSide::Writer => "writer",
        }
    }
}

/// The channel's behavior between the transport-supplied behavior and the
/// stable pipes.
///
/// Delegates to the transport behavior first; whenever it declines to
/// handle, the wrapper escalates transport errors and inner completions
/// into reconnect requests, while timeouts stay caller-visible and a
/// disposed or non-reconnecting channel lets everything through.
///
/// The back-reference to the channel is non-owning and used for dispatch
/// only; the channel owns both pipes and this wrapper.
pub struct ChannelPipeBehavior {
    channel: Weak<ChannelShared>,
    side: PipeSide,
    delegate: RwLock<Option<std::sync::Arc<dyn StablePipeBehavior>>>,
}

impl ChannelPipeBehavior {
    pub fn new(channel: Weak<ChannelShared>, side: PipeSide) -> Self {
        Self {
            channel,
            side,
            delegate: RwLock::new(None),
        }
    }

    /// Installs (or clears) the transport-supplied behavior. Called on
    /// every successful open.
    pub fn set_delegate(&self, delegate: Option<std::sync::Arc<dyn StablePipeBehavior>>) {
        *self.delegate.write().expect("delegate lock poisoned") = delegate;
    }

    fn delegate(&self) -> Option<std::sync::Arc<dyn StablePipeBehavior>> {
        self.delegate
            .read()
            .expect("delegate lock poisoned")
            .clone()
    }
}

impl StablePipeBehavior for ChannelPipeBehavior {
    fn on_error(&self, error: &PipeError) -> ErrorAction {
        if let Some(delegate) = self.delegate() {
            match delegate.on_error(error) {
                ErrorAction::Throw => {},
                handled => return handled,
            }
        }
        // Timeouts are caller-visible, never communication faults.
        if error.is_timeout() {
            return ErrorAction::Throw;
        }
        let Some(channel) = self.channel.upgrade() else {
            return ErrorAction::Throw;
        };
        if channel.is_disposed() || !channel.auto_reconnect() {
            return ErrorAction::Throw;
        }
        // Detach both pipes so the retried operation waits for a fresh
        // inner instead of spinning on the broken one, then hand the
        // failure to the supervisor.
        channel.reader().close(false);
        channel.writer().close(false);
        channel.fire_pipe_error(self.side, error);
        ErrorAction::Retry
    }

    fn on_swallowed(&self, error: &PipeError) {
        if let Some(delegate) = self.delegate() {
            delegate.on_swallowed(error);
            return;
        }
        debug!(
            "{} swallowed error from a replaced inner pipe: {error}",
            self.side.as_str()
        );
    }

    fn on_cancel(&self) {
        if let Some(delegate) = self.delegate() {
            delegate.on_cancel();
        }
    }

    fn on_inner_completed(&self) -> CompletionAction {
        if let Some(delegate) = self.delegate() {
            match delegate.on_inner_completed() {
                CompletionAction::Complete => {},
                handled => return handled,
            }
        }
        let Some(channel) = self.channel.upgrade() else {
            return CompletionAction::Complete;
        };
        if channel.is_disposed() {
            return CompletionAction::Complete;
        }
        channel.reader().close(false);
        channel.writer().close(false);
        channel.fire_inner_completed(self.side);
        if channel.auto_reconnect() {
            CompletionAction::Retry
        } else {
            CompletionAction::Complete
        }
    }

    fn return_inner_canceled(&self) -> bool {
        self.delegate()
            .map(|d| d.return_inner_canceled())
            .unwrap_or(true)
    }
}
