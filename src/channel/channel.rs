// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

use crate::{
    cfg::config::{BasicChannelConfig, Reconfigure, SharedConfig},
    channel::{
        behavior::{ChannelPipeBehavior, PipeSide},
        channel_impl::{ChannelImpl, OpenedPipes},
        log_ring::LogCaptureRing,
        reconnector::Reconnector,
        status::{ConnectionAvailability, ConnectionStatusChanged, LogEntry},
    },
    pipe::{error::PipeError, stable_reader::StableReader, stable_writer::StableWriter},
};

/// Deadline for a single `initial_open` attempt.
const INITIAL_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CHANNEL_NAME: AtomicU64 = AtomicU64::new(1);

/// Everything guarded by the channel's async lock: the stored
/// configuration, the current transport, and the retry planner.
struct SupervisorState {
    config: SharedConfig,
    channel_impl: Option<Box<dyn ChannelImpl>>,
    reconnector: Option<Reconnector>,
}

struct StatusState {
    current: ConnectionAvailability,
    emitted: Option<ConnectionAvailability>,
}

/// Shared core of a communication channel; owned by [`CommChannel`] and
/// back-referenced weakly by behaviors, reconnectors, and spawned tasks.
pub struct ChannelShared {
    name: u64,
    weak: Weak<ChannelShared>,
    reader: Arc<StableReader>,
    writer: Arc<StableWriter>,
    reader_behavior: Arc<ChannelPipeBehavior>,
    writer_behavior: Arc<ChannelPipeBehavior>,
    supervisor: tokio::sync::Mutex<SupervisorState>,
    status: Mutex<StatusState>,
    status_tx: broadcast::Sender<ConnectionStatusChanged>,
    ring: LogCaptureRing,
    /// Incremented on every successful pipe attachment; fire-and-forget
    /// error reports from older transports are recognized as stale by it.
    generation: AtomicU64,
    auto_reconnect: AtomicBool,
    disposed: AtomicBool,
    dispose_token: CancellationToken,
}

impl ChannelShared {
    pub fn name(&self) -> u64 {
        self.name
    }

    pub fn reader(&self) -> Arc<StableReader> {
        self.reader.clone()
    }

    pub fn writer(&self) -> Arc<StableWriter> {
        self.writer.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn set_auto_reconnect(&self, value: bool) {
        self.auto_reconnect.store(value, Ordering::SeqCst);
    }

    pub fn connection_status(&self) -> ConnectionAvailability {
        self.status.lock().expect("status lock poisoned").current
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatusChanged> {
        self.status_tx.subscribe()
    }

    fn tag(&self) -> String {
        format!("channel#{}", self.name)
    }

    fn record(&self, level: Level, text: String, error: Option<String>) {
        let mut entry = LogEntry::new(level, self.tag(), text);
        if let Some(error) = error {
            entry = entry.with_error(error);
        }
        self.ring.record(entry);
    }

    fn apply_basic(&self, basic: &BasicChannelConfig) {
        self.reader.set_default_timeout(basic.read_timeout());
        self.writer.set_default_timeout(basic.write_timeout());
        self.writer
            .set_retry_write_count(basic.effective_retry_write_count());
        self.set_auto_reconnect(basic.auto_reconnect);
    }

    /// Applies a status transition and emits the change to subscribers.
    /// Two consecutive emissions are never equal; a transition out of
    /// `Connected` snapshots the log ring into capture mode first.
    fn set_status(&self, new: ConnectionAvailability) {
        let emit = {
            let mut st = self.status.lock().expect("status lock poisoned");
            let old = st.current;
            st.current = new;
            if new.is_connected() {
                self.ring.exit_capture();
            } else if old.is_connected() {
                self.ring.enter_capture();
            }
            if st.emitted == Some(new) {
                None
            } else {
                st.emitted = Some(new);
                let error_context: Arc<[LogEntry]> = if new.is_connected() {
                    Arc::from(Vec::new())
                } else {
                    Arc::from(self.ring.snapshot())
                };
                Some(ConnectionStatusChanged {
                    channel: self.name,
                    connection_status: new,
                    error_context,
                })
            }
        };
        if let Some(event) = emit {
            debug!("{} status -> {}", self.tag(), event.connection_status);
            let _ = self.status_tx.send(event);
        }
    }

    fn degrade_status(&self) {
        let current = self.connection_status();
        self.set_status(current.decrement());
    }

    fn attach_pipes(&self, pipes: OpenedPipes) {
        self.reader_behavior.set_delegate(pipes.reader_behavior);
        self.writer_behavior.set_delegate(pipes.writer_behavior);
        self.reader.set_inner(pipes.source, true);
        self.writer.set_inner(pipes.sink, true);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Non-blocking escalation from a pipe behavior: hands the failure to
    /// the supervisor on a spawned task. Must never propagate anything.
    pub(crate) fn fire_pipe_error(&self, side: PipeSide, error: &PipeError) {
        self.record(
            Level::WARN,
            format!("{} pipe error", side.as_str()),
            Some(error.to_string()),
        );
        warn!("{} {} pipe error: {error}", self.tag(), side.as_str());
        let generation = self.generation();
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            this.on_pipe_failure(generation).await;
        });
    }

    /// Non-blocking escalation for an inner pipe completed by the peer.
    pub(crate) fn fire_inner_completed(&self, side: PipeSide) {
        self.record(
            Level::WARN,
            format!("{} inner pipe completed by the peer", side.as_str()),
            None,
        );
        info!("{} {} inner pipe completed", self.tag(), side.as_str());
        let generation = self.generation();
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            this.on_pipe_failure(generation).await;
        });
    }

    /// Supervisor entry for both pipe errors and inner completions: tear
    /// the transport down and try to open a fresh one.
    async fn on_pipe_failure(self: Arc<Self>, generation: u64) {
        let mut st = self.supervisor.lock().await;
        if self.is_disposed() {
            return;
        }
        // A reopen already replaced the transport this report came from.
        // The report is only ignorable while the fresh pipes are healthy:
        // a racing behavior may have detached them, and then the recovery
        // still has to run.
        if generation != self.generation() && self.reader.has_inner() {
            debug!("{} stale pipe failure ignored", self.tag());
            return;
        }
        if !self.auto_reconnect() {
            return;
        }
        self.close_channel(&mut st, false).await;
        self.reopen(&mut st, false).await;
    }

    /// Fire-and-forget first open right after construction.
    pub(crate) async fn initial_open_task(self: Arc<Self>) {
        let mut st = self.supervisor.lock().await;
        if self.is_disposed() {
            return;
        }
        self.reopen(&mut st, false).await;
    }

    /// Reconnector tick: one reopen attempt under the supervisor lock.
    pub(crate) async fn on_reconnector_tick(&self) {
        let mut st = self.supervisor.lock().await;
        if self.is_disposed() || !self.auto_reconnect() {
            return;
        }
        if self.reader.has_inner() {
            // Another path already reconnected. Retire this planner so a
            // later failure starts a fresh one (a kept planner with no
            // pending tick would never fire again).
            if let Some(reconnector) = st.reconnector.take() {
                reconnector.dispose();
            }
            return;
        }
        self.reopen(&mut st, true).await;
    }

    /// One open attempt. On success wires the pipes and jumps to
    /// `Connected`; on failure tears down, decrements the availability and
    /// plans the next attempt. Never propagates: callers are
    /// fire-and-forget paths whose only safety net is the log.
    async fn reopen(&self, st: &mut SupervisorState, via_reconnector: bool) {
        self.reader.close(false);
        self.writer.close(false);

        if st.channel_impl.is_none() {
            match st.config.create_channel_impl(true) {
                Ok(channel_impl) => st.channel_impl = Some(channel_impl),
                Err(err) => {
                    self.record(
                        Level::ERROR,
                        "creating the transport failed".to_string(),
                        Some(format!("{err:#}")),
                    );
                    warn!("{} creating the transport failed: {err:#}", self.tag());
                    self.degrade_status();
                    self.plan_retry(st, via_reconnector);
                    return;
                },
            }
        }
        let Some(channel_impl) = st.channel_impl.as_mut() else {
            return;
        };

        let outcome = tokio::time::timeout(
            INITIAL_OPEN_TIMEOUT,
            channel_impl.initial_open(&self.dispose_token),
        )
        .await;
        let failure = match outcome {
            Ok(Ok(pipes)) => {
                self.attach_pipes(pipes);
                if let Some(reconnector) = st.reconnector.take() {
                    reconnector.dispose();
                }
                info!("{} connected ({})", self.tag(), st.config.display_name());
                self.set_status(ConnectionAvailability::Connected);
                return;
            },
            Ok(Err(err)) => format!("{err:#}"),
            Err(_) => format!("open timed out after {INITIAL_OPEN_TIMEOUT:?}"),
        };

        self.record(
            Level::WARN,
            "connection attempt failed".to_string(),
            Some(failure.clone()),
        );
        debug!("{} connection attempt failed: {failure}", self.tag());
        self.close_channel(st, false).await;
        self.degrade_status();
        self.plan_retry(st, via_reconnector);
    }

    fn plan_retry(&self, st: &mut SupervisorState, via_reconnector: bool) {
        if !self.auto_reconnect() || self.is_disposed() {
            return;
        }
        match &st.reconnector {
            Some(reconnector) if via_reconnector => reconnector.plan_next(),
            Some(_) => {},
            None => {
                st.reconnector = Some(Reconnector::spawn_initial(self.weak.clone()));
            },
        }
    }

    /// Detaches the stable pipes, disposes the transport, and (unless
    /// completing) pre-stages a fresh unopened transport for the next
    /// reopen. A `Connected` channel drops to `Low` here: this is the
    /// channel-level transition from "working" to "first trouble".
    async fn close_channel(&self, st: &mut SupervisorState, complete: bool) {
        self.reader.close(complete);
        self.writer.close(complete);
        if self.connection_status().is_connected() {
            self.set_status(ConnectionAvailability::Low);
        }
        if let Some(mut channel_impl) = st.channel_impl.take() {
            channel_impl.dispose().await;
        }
        if !complete {
            match st.config.create_channel_impl(false) {
                Ok(channel_impl) => st.channel_impl = Some(channel_impl),
                Err(err) => {
                    self.record(
                        Level::ERROR,
                        "pre-staging the next transport failed".to_string(),
                        Some(format!("{err:#}")),
                    );
                    warn!(
                        "{} pre-staging the next transport failed: {err:#}",
                        self.tag()
                    );
                },
            }
        }
    }

    pub(crate) async fn reconfigure(&self, new_config: SharedConfig) -> Result<()> {
        new_config
            .check_valid()
            .context("invalid channel configuration")?;
        let mut st = self.supervisor.lock().await;
        if self.is_disposed() {
            bail!("channel#{} is disposed", self.name);
        }

        self.apply_basic(new_config.basic());

        let mut verdict = st.config.can_dynamic_reconfigure_with(new_config.as_ref());
        if verdict == Reconfigure::Identical && st.config.basic() != new_config.basic()
        {
            verdict = Reconfigure::Dynamic;
        }
        match verdict {
            Reconfigure::Identical => Ok(()),
            Reconfigure::Dynamic => {
                st.config = new_config;
                let st = &mut *st;
                if let Some(channel_impl) = st.channel_impl.as_mut() {
                    channel_impl
                        .dynamic_reconfigure(st.config.as_ref())
                        .await
                        .context("dynamic reconfigure failed")?;
                }
                info!("{} reconfigured dynamically", self.tag());
                Ok(())
            },
            Reconfigure::Restart => {
                info!("{} reconfigured, restarting the transport", self.tag());
                st.config = new_config;
                self.close_channel(&mut st, false).await;
                // Even with auto-reconnect off the new configuration gets
                // one open attempt to prove itself.
                self.reopen(&mut st, false).await;
                Ok(())
            },
        }
    }

    pub(crate) async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispose_token.cancel();
        let mut st = self.supervisor.lock().await;
        if let Some(reconnector) = st.reconnector.take() {
            reconnector.dispose();
        }
        self.reader.close(true);
        self.writer.close(true);
        if let Some(mut channel_impl) = st.channel_impl.take() {
            channel_impl.dispose().await;
        }
        self.set_status(ConnectionAvailability::None);
        info!("{} disposed", self.tag());
    }
}

/// A durable byte-stream channel over a replaceable transport.
///
/// Owns a [`StableReader`]/[`StableWriter`] pair wired to whatever
/// transport the configuration currently describes; tracks connection
/// availability, reconnects automatically with a back-off schedule, and
/// reconfigures in place when the transport allows it. Users read and
/// write through the stable pipes (usually via the message layer) and
/// never observe transport replacement beyond latency and status events.
pub struct CommChannel {
    shared: Arc<ChannelShared>,
}

impl CommChannel {
    /// Validates the configuration, builds the channel, and starts the
    /// first open. Must be called within a tokio runtime.
    pub fn new(config: SharedConfig) -> Result<Self> {
        config
            .check_valid()
            .context("invalid channel configuration")?;
        let basic = config.basic().clone();

        let shared = Arc::new_cyclic(|weak: &Weak<ChannelShared>| {
            let reader_behavior =
                Arc::new(ChannelPipeBehavior::new(weak.clone(), PipeSide::Reader));
            let writer_behavior =
                Arc::new(ChannelPipeBehavior::new(weak.clone(), PipeSide::Writer));
            let reader =
                Arc::new(StableReader::with_behavior(reader_behavior.clone()));
            let writer =
                Arc::new(StableWriter::with_behavior(writer_behavior.clone()));
            let (status_tx, _) = broadcast::channel(64);
            ChannelShared {
                name: NEXT_CHANNEL_NAME.fetch_add(1, Ordering::SeqCst),
                weak: weak.clone(),
                reader,
                writer,
                reader_behavior,
                writer_behavior,
                supervisor: tokio::sync::Mutex::new(SupervisorState {
                    config: config.clone(),
                    channel_impl: None,
                    reconnector: None,
                }),
                status: Mutex::new(StatusState {
                    current: ConnectionAvailability::Connected,
                    emitted: None,
                }),
                status_tx,
                ring: LogCaptureRing::new(),
                generation: AtomicU64::new(0),
                auto_reconnect: AtomicBool::new(true),
                disposed: AtomicBool::new(false),
                dispose_token: CancellationToken::new(),
            }
        });
        shared.apply_basic(&basic);

        let mut channel_impl = config
            .create_channel_impl(true)
            .context("creating the transport failed")?;
        let pre_opened = channel_impl.take_open_pipes();
        {
            let mut st = shared
                .supervisor
                .try_lock()
                .expect("freshly created channel lock");
            st.channel_impl = Some(channel_impl);
        }
        match pre_opened {
            Some(pipes) => {
                shared.attach_pipes(pipes);
                shared.set_status(ConnectionAvailability::Connected);
            },
            None => {
                let task = shared.clone();
                tokio::spawn(async move {
                    task.initial_open_task().await;
                });
            },
        }
        Ok(Self { shared })
    }

    /// Unique numeric name of this channel.
    pub fn name(&self) -> u64 {
        self.shared.name()
    }

    pub fn reader(&self) -> Arc<StableReader> {
        self.shared.reader()
    }

    pub fn writer(&self) -> Arc<StableWriter> {
        self.shared.writer()
    }

    pub fn connection_status(&self) -> ConnectionAvailability {
        self.shared.connection_status()
    }

    /// Subscribes to [`ConnectionStatusChanged`] events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatusChanged> {
        self.shared.subscribe()
    }

    pub fn auto_reconnect(&self) -> bool {
        self.shared.auto_reconnect()
    }

    pub fn set_auto_reconnect(&self, value: bool) {
        self.shared.set_auto_reconnect(value);
    }

    /// Applies a new configuration: no-op when identical, in place when
    /// the transport supports it, or by a close-and-reopen cycle.
    pub async fn reconfigure(&self, config: SharedConfig) -> Result<()> {
        self.shared.reconfigure(config).await
    }

    /// Terminates the channel: stops reconnecting, completes both stable
    /// pipes, and disposes the transport.
    pub async fn dispose(&self) {
        self.shared.dispose().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }
}
