// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::channel::ChannelShared;

/// Delay before the very first reconnect attempt after a failure.
pub const INITIAL_DELAY: Duration = Duration::from_millis(50);

/// Back-off schedule for reconnect attempts. The reconnector never gives up
/// on its own; only channel shutdown or `auto_reconnect = false` stops it.
pub fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(match attempt {
        0 | 1 => 100,
        2 => 150,
        3..=4 => 250,
        5..=10 => 500,
        _ => 1000,
    })
}

struct ReconnectorInner {
    channel: Weak<ChannelShared>,
    attempt: AtomicU32,
    in_flight: AtomicBool,
    cancel: CancellationToken,
}

/// Timer-driven retry planner. Each scheduled tick re-enters the channel's
/// supervisor through the fire-and-forget reconnect path; `plan_next` is
/// called from inside that path when the attempt failed.
#[derive(Clone)]
pub struct Reconnector {
    inner: Arc<ReconnectorInner>,
}

impl Reconnector {
    /// Creates the reconnector and schedules its first tick after
    /// [`INITIAL_DELAY`].
    pub fn spawn_initial(channel: Weak<ChannelShared>) -> Self {
        let this = Self {
            inner: Arc::new(ReconnectorInner {
                channel,
                attempt: AtomicU32::new(0),
                in_flight: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        };
        this.schedule(INITIAL_DELAY);
        this
    }

    /// Schedules the next attempt per the back-off table.
    pub fn plan_next(&self) {
        let attempt = self.inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = retry_delay(attempt);
        debug!("reconnect attempt {attempt} planned in {delay:?}");
        self.schedule(delay);
    }

    pub fn attempt(&self) -> u32 {
        self.inner.attempt.load(Ordering::SeqCst)
    }

    /// Stops the timer; a tick already past its guard still runs out.
    pub fn dispose(&self) {
        self.inner.cancel.cancel();
    }

    fn schedule(&self, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.inner.cancel.cancelled() => return,
                _ = sleep(delay) => {},
            }
            // One tick in the channel at a time.
            if this.inner.in_flight.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(channel) = this.inner.channel.upgrade() {
                channel.on_reconnector_tick().await;
            }
            this.inner.in_flight.store(false, Ordering::SeqCst);
        });
    }
}
