// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Discovery Errors

use std::time::Duration;

use thiserror::Error;

use crate::network::NetworkError;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Contact discovery errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The batch exceeds the protocol maximum. Callers must chunk.
    #[error("Too many identifiers: {count} (max {max})")]
    BatchTooLarge {
        /// Identifiers in the request.
        count: usize,
        /// Protocol maximum.
        max: usize,
    },

    /// An identifier is not a valid E.164 number.
    #[error("Invalid E.164 number: {0}")]
    InvalidE164(String),

    /// The service asked us to back off.
    #[error("Rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        /// Advertised cooldown.
        retry_after: Duration,
    },

    /// The enclave failed attestation. Never retried.
    #[error("Attestation invalid: {0}")]
    AttestationInvalid(String),

    /// The key exchange with the enclave failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Encryption or decryption failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The peer sent something the protocol does not allow.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Fetching discovery credentials failed.
    #[error("Auth error: {0}")]
    Auth(String),

    /// The enclave closed the connection with an unexpected code.
    #[error("Connection closed with {code}: {reason}")]
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// Transport failure.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl DiscoveryError {
    /// Returns true for errors that must never be retried automatically.
    pub fn is_fatal(&self) -> bool {
        match self {
            DiscoveryError::AttestationInvalid(_) => true,
            DiscoveryError::Network(error) => error.is_auth_rejection(),
            _ => false,
        }
    }
}
