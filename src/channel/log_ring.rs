// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::VecDeque, sync::Mutex};

use crate::channel::status::LogEntry;

/// Records kept while connected (rolling, oldest evicted).
pub const RUNNING_CAPACITY: usize = 5;
/// Records kept after a disconnect (ring prologue plus follow-on entries).
pub const CAPTURE_CAPACITY: usize = 20;

#[derive(Debug, Default)]
struct RingState {
    running: VecDeque<LogEntry>,
    capture: Vec<LogEntry>,
    capturing: bool,
}

/// Per-channel ring of recent diagnostic records.
///
/// Two modes. While connected, every record appends to a rolling ring of
/// [`RUNNING_CAPACITY`] entries. When the connection is lost the ring is
/// drained (oldest first) into a capture array and further records append
/// there until [`CAPTURE_CAPACITY`] is reached, so a status subscriber sees
/// a short prologue around the first failure plus the follow-on noise. On
/// return to connected the capture is cleared.
#[derive(Debug, Default)]
pub struct LogCaptureRing {
    state: Mutex<RingState>,
}

impl LogCaptureRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: LogEntry) {
        let mut st = self.state.lock().expect("ring lock poisoned");
        if st.capturing {
            if st.capture.len() < CAPTURE_CAPACITY {
                st.capture.push(entry);
            }
            return;
        }
        if st.running.len() == RUNNING_CAPACITY {
            st.running.pop_front();
        }
        st.running.push_back(entry);
    }

    /// Switches to capture mode: the ring's live contents become the
    /// capture prologue. Idempotent while already capturing.
    pub fn enter_capture(&self) {
        let mut st = self.state.lock().expect("ring lock poisoned");
        if st.capturing {
            return;
        }
        st.capturing = true;
        let prologue: Vec<LogEntry> = st.running.drain(..).collect();
        st.capture = prologue;
    }

    /// Back to running mode; the capture is dropped.
    pub fn exit_capture(&self) {
        let mut st = self.state.lock().expect("ring lock poisoned");
        st.capturing = false;
        st.capture.clear();
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().expect("ring lock poisoned").capturing
    }

    /// Chronological snapshot of whatever the current mode holds.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        let st = self.state.lock().expect("ring lock poisoned");
        if st.capturing {
            st.capture.clone()
        } else {
            st.running.iter().cloned().collect()
        }
    }
}
