// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use comm_channel_rs::channel::reconnector::{INITIAL_DELAY, retry_delay};

#[test]
fn backoff_schedule_matches_the_table() {
    let expected_ms: Vec<u64> = vec![
        100, 150, 250, 250, 500, 500, 500, 500, 500, 500, 1000, 1000, 1000,
    ];
    let actual_ms: Vec<u64> = (1..=13)
        .map(|attempt| retry_delay(attempt).as_millis() as u64)
        .collect();
    assert_eq!(actual_ms, expected_ms);
}

#[test]
fn backoff_never_gives_up() {
    // The schedule flattens at one second and stays there.
    assert_eq!(retry_delay(100), Duration::from_millis(1000));
    assert_eq!(retry_delay(u32::MAX), Duration::from_millis(1000));
}

#[test]
fn first_attempt_comes_quickly() {
    assert_eq!(INITIAL_DELAY, Duration::from_millis(50));
    assert!(INITIAL_DELAY < retry_delay(1));
}
