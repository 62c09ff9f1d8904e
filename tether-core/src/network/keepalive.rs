// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Keepalive Monitor
//!
//! Probes a Resource with `GET <path>` after every quiet interval. Any
//! inbound frame resets the timer. The connection is closed with
//! [`UNEXPECTED_DISCONNECT_CODE`] when a probe fails, answers non-2xx, or
//! when the last sign of life is older than the stale threshold.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::NetworkError;
use super::resource::{SendRequestOptions, WeakResource};
use super::transport::UNEXPECTED_DISCONNECT_CODE;

/// Quiet time before a probe is sent.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(55);

/// Maximum age of the last sign of life before the connection is dropped.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// How long a probe may go unanswered.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes slower than this are logged as delayed.
pub const MAX_HEALTHY_RESPONSE_TIME: Duration = Duration::from_millis(500);

/// Keepalive settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Probe path.
    pub path: String,
    /// Quiet interval between probes.
    pub interval: Duration,
    /// Maximum age of the last sign of life.
    pub stale_threshold: Duration,
    /// Probe response deadline.
    pub response_timeout: Duration,
    /// Close the connection when a probe goes unanswered.
    pub disconnect_on_no_response: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            path: "/".to_string(),
            interval: KEEPALIVE_INTERVAL,
            stale_threshold: STALE_THRESHOLD,
            response_timeout: KEEPALIVE_TIMEOUT,
            disconnect_on_no_response: true,
        }
    }
}

impl KeepAliveConfig {
    /// Default settings probing `path`.
    pub fn with_path(path: &str) -> Self {
        KeepAliveConfig {
            path: path.to_string(),
            ..Default::default()
        }
    }
}

enum Signal {
    Reset,
    Force(Option<Duration>),
    Stop,
}

/// Control handle owned by the Resource driver.
pub(crate) struct KeepAliveHandle {
    signals: mpsc::UnboundedSender<Signal>,
}

impl KeepAliveHandle {
    pub(crate) fn reset(&self) {
        let _ = self.signals.send(Signal::Reset);
    }

    pub(crate) fn force(&self, timeout: Option<Duration>) {
        let _ = self.signals.send(Signal::Force(timeout));
    }

    pub(crate) fn stop(&self) {
        let _ = self.signals.send(Signal::Stop);
    }
}

pub(crate) fn spawn(name: &str, config: KeepAliveConfig, target: WeakResource) -> KeepAliveHandle {
    let (signals, receiver) = mpsc::unbounded_channel();
    let monitor = KeepAlive {
        name: name.to_string(),
        config,
        target,
        signals: receiver,
        last_alive_at: Instant::now(),
    };
    tokio::spawn(monitor.run());
    KeepAliveHandle { signals }
}

struct KeepAlive {
    name: String,
    config: KeepAliveConfig,
    target: WeakResource,
    signals: mpsc::UnboundedReceiver<Signal>,
    last_alive_at: Instant,
}

impl KeepAlive {
    async fn run(mut self) {
        let mut next_probe = self.last_alive_at + self.config.interval;
        loop {
            tokio::select! {
                signal = self.signals.recv() => match signal {
                    Some(Signal::Reset) => {
                        self.last_alive_at = Instant::now();
                        next_probe = self.last_alive_at + self.config.interval;
                    }
                    Some(Signal::Force(timeout)) => {
                        if !self.probe(timeout).await {
                            return;
                        }
                        next_probe = Instant::now() + self.config.interval;
                    }
                    Some(Signal::Stop) | None => return,
                },
                _ = tokio::time::sleep_until(next_probe) => {
                    if !self.probe(None).await {
                        return;
                    }
                    next_probe = Instant::now() + self.config.interval;
                }
            }
        }
    }

    /// Sends one probe. Returns false once the monitor should stop.
    async fn probe(&mut self, timeout: Option<Duration>) -> bool {
        if self.last_alive_at.elapsed() > self.config.stale_threshold {
            warn!(resource = %self.name, "Last keepalive was too far in the past");
            self.target.close(
                UNEXPECTED_DISCONNECT_CODE,
                "Last keepalive request was too far in the past",
            );
            return false;
        }

        let response_timeout = timeout.unwrap_or(self.config.response_timeout);
        let options =
            SendRequestOptions::new("GET", &self.config.path).with_timeout(response_timeout);
        let Some(reply) = self.target.request(options) else {
            return false;
        };

        debug!(resource = %self.name, "Sending keepalive");
        let sent_at = Instant::now();
        match reply.await {
            Ok(Ok(response)) if response.is_success() => {
                let elapsed = sent_at.elapsed();
                if elapsed > MAX_HEALTHY_RESPONSE_TIME {
                    info!(resource = %self.name, elapsed_ms = elapsed.as_millis() as u64, "Delayed keepalive response");
                }
                self.last_alive_at = Instant::now();
                true
            }
            Ok(Ok(response)) if response.is_connection_closed() => false,
            Ok(Ok(response)) => {
                warn!(resource = %self.name, status = response.status, "Keepalive failed");
                self.target.close(
                    UNEXPECTED_DISCONNECT_CODE,
                    &format!("Keepalive response with {} code", response.status),
                );
                false
            }
            Ok(Err(NetworkError::RequestTimedOut { .. })) => {
                if !self.config.disconnect_on_no_response {
                    info!(resource = %self.name, "Keepalive unanswered, keeping connection");
                    return true;
                }
                warn!(resource = %self.name, "Keepalive unanswered");
                self.target.close(
                    UNEXPECTED_DISCONNECT_CODE,
                    &format!(
                        "No response to keepalive request after {}ms",
                        response_timeout.as_millis()
                    ),
                );
                false
            }
            Ok(Err(NetworkError::ShuttingDown)) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }
}
