// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::Level;

/// How much a channel currently trusts its transport.
///
/// Ordered: `None < DangerZone < Low < Connected`. A successful open jumps
/// directly to `Connected`; a disconnect from `Connected` lowers to `Low`
/// and each further failed reconnect attempt decrements one step until
/// clamped at `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionAvailability {
    None,
    DangerZone,
    Low,
    Connected,
}

impl ConnectionAvailability {
    /// One step down, clamped at `None`.
    pub fn decrement(self) -> Self {
        match self {
            ConnectionAvailability::Connected => ConnectionAvailability::Low,
            ConnectionAvailability::Low => ConnectionAvailability::DangerZone,
            ConnectionAvailability::DangerZone | ConnectionAvailability::None => {
                ConnectionAvailability::None
            },
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionAvailability::Connected)
    }
}

impl std::fmt::Display for ConnectionAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionAvailability::None => "None",
            ConnectionAvailability::DangerZone => "DangerZone",
            ConnectionAvailability::Low => "Low",
            ConnectionAvailability::Connected => "Connected",
        })
    }
}

/// One diagnostic record kept by the channel's log capture ring and shipped
/// to subscribers with degraded status-change events.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    /// Channel tag, e.g. `channel#4`.
    pub tags: String,
    pub text: String,
    /// Rendered cause, when the record was raised by an error.
    pub error: Option<String>,
}

impl LogEntry {
    pub fn new(level: Level, tags: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            tags: tags.into(),
            text: text.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Payload delivered to status subscribers.
///
/// `error_context` is empty while `Connected` and otherwise carries the log
/// capture ring's snapshot: the last few records before the disconnect plus
/// everything captured since.
#[derive(Debug, Clone)]
pub struct ConnectionStatusChanged {
    /// The channel's unique numeric name.
    pub channel: u64,
    pub connection_status: ConnectionAvailability,
    pub error_context: Arc<[LogEntry]>,
}
