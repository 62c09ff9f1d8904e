// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Backoff Tests
//!
//! Tests for the reconnect delay schedule.

use std::time::Duration;

use tether_core::network::{
    BackOff, DEFAULT_JITTER, EXTENDED_FIBONACCI_TIMEOUTS, FIBONACCI_TIMEOUTS,
};

/// Test: delays follow the schedule and saturate at its end
#[test]
fn test_delays_follow_schedule() {
    let mut backoff = BackOff::new(FIBONACCI_TIMEOUTS, Duration::ZERO);

    let delays: Vec<u64> = (0..12).map(|_| backoff.get_and_increment().as_secs()).collect();

    assert_eq!(delays, vec![1, 2, 3, 5, 8, 13, 21, 34, 55, 55, 55, 55]);
    assert!(backoff.is_last());
}

/// Test: reset starts over from the first delay
#[test]
fn test_reset_returns_to_first_delay() {
    let mut backoff = BackOff::new(FIBONACCI_TIMEOUTS, Duration::ZERO);
    for _ in 0..5 {
        backoff.get_and_increment();
    }
    assert_eq!(backoff.attempts(), 5);

    backoff.reset(None);

    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.get(), Duration::from_secs(1));
}

/// Test: reset can switch to the extended schedule
#[test]
fn test_reset_switches_schedule() {
    let mut backoff = BackOff::new(FIBONACCI_TIMEOUTS, Duration::ZERO);
    backoff.reset(Some(EXTENDED_FIBONACCI_TIMEOUTS));

    let last = (0..EXTENDED_FIBONACCI_TIMEOUTS.len() + 2)
        .map(|_| backoff.get_and_increment())
        .last()
        .unwrap();

    assert_eq!(last, Duration::from_secs(987));
}

/// Test: jitter is added but bounded
#[test]
fn test_jitter_added_within_bound() {
    let mut backoff = BackOff::new(FIBONACCI_TIMEOUTS, DEFAULT_JITTER);
    for &base in FIBONACCI_TIMEOUTS {
        let delay = backoff.get_and_increment();
        assert!(delay >= base);
        assert!(delay <= base + DEFAULT_JITTER);
    }
}

/// Test: the default uses the short schedule with the default jitter
#[test]
fn test_default_backoff() {
    let backoff = BackOff::default();
    assert_eq!(backoff.get(), FIBONACCI_TIMEOUTS[0]);
    assert_eq!(backoff.attempts(), 0);
    assert!(!backoff.is_last());
}
