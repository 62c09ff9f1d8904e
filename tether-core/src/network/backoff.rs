// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Reconnect Backoff
//!
//! Walks a fixed delay schedule, saturating at its last entry, and adds a
//! random jitter to every delay it hands out.

use std::time::Duration;

use rand::Rng;

/// Default reconnect schedule: Fibonacci seconds up to 55s.
pub const FIBONACCI_TIMEOUTS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(8),
    Duration::from_secs(13),
    Duration::from_secs(21),
    Duration::from_secs(34),
    Duration::from_secs(55),
];

/// Schedule used while the host reports no network: continues the Fibonacci
/// sequence up to roughly 16 minutes.
pub const EXTENDED_FIBONACCI_TIMEOUTS: &[Duration] = &[
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(5),
    Duration::from_secs(8),
    Duration::from_secs(13),
    Duration::from_secs(21),
    Duration::from_secs(34),
    Duration::from_secs(55),
    Duration::from_secs(89),
    Duration::from_secs(144),
    Duration::from_secs(233),
    Duration::from_secs(377),
    Duration::from_secs(610),
    Duration::from_secs(987),
];

/// Default upper bound of the random jitter added to each delay.
pub const DEFAULT_JITTER: Duration = Duration::from_secs(5);

/// Delay schedule with an attempt counter.
#[derive(Debug, Clone)]
pub struct BackOff {
    timeouts: &'static [Duration],
    count: usize,
    jitter: Duration,
}

impl BackOff {
    /// Creates a backoff over `timeouts`. An empty schedule yields zero
    /// delays plus jitter.
    pub fn new(timeouts: &'static [Duration], jitter: Duration) -> Self {
        BackOff {
            timeouts,
            count: 0,
            jitter,
        }
    }

    /// Returns the current schedule entry without jitter.
    pub fn get(&self) -> Duration {
        match self.timeouts.len() {
            0 => Duration::ZERO,
            len => self.timeouts[self.count.min(len - 1)],
        }
    }

    /// Returns the current delay plus jitter and advances the schedule.
    pub fn get_and_increment(&mut self) -> Duration {
        let delay = self.get() + self.random_jitter();
        if self.count < self.timeouts.len() {
            self.count += 1;
        }
        delay
    }

    /// Restarts at the first entry, optionally switching schedules.
    pub fn reset(&mut self, timeouts: Option<&'static [Duration]>) {
        if let Some(timeouts) = timeouts {
            self.timeouts = timeouts;
        }
        self.count = 0;
    }

    /// Returns true once the schedule has saturated.
    pub fn is_last(&self) -> bool {
        self.count + 1 >= self.timeouts.len()
    }

    /// Number of delays handed out since the last reset (saturating).
    pub fn attempts(&self) -> usize {
        self.count
    }

    fn random_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

impl Default for BackOff {
    fn default() -> Self {
        BackOff::new(FIBONACCI_TIMEOUTS, DEFAULT_JITTER)
    }
}

// INLINE_TEST_REQUIRED: Inspects the private counter after saturation
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_saturates_at_schedule_length() {
        let mut backoff = BackOff::new(FIBONACCI_TIMEOUTS, Duration::ZERO);
        for _ in 0..50 {
            backoff.get_and_increment();
        }
        assert_eq!(backoff.count, FIBONACCI_TIMEOUTS.len());
        assert_eq!(backoff.get(), Duration::from_secs(55));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let mut backoff = BackOff::new(FIBONACCI_TIMEOUTS, Duration::from_secs(5));
        for _ in 0..20 {
            backoff.reset(None);
            let delay = backoff.get_and_increment();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn test_empty_schedule_is_zero() {
        let mut backoff = BackOff::new(&[], Duration::ZERO);
        assert_eq!(backoff.get_and_increment(), Duration::ZERO);
    }
}
