// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Network Errors

use thiserror::Error;

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Network layer errors.
///
/// Errors are `Clone` so a single connect attempt can be awaited by several
/// callers at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Connection could not be established.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The underlying socket closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Establishing the connection took too long.
    #[error("Connection timeout")]
    Timeout,

    /// No response arrived for an outgoing request in time.
    #[error("Request timed out: {verb} {path}")]
    RequestTimedOut {
        /// Request verb.
        verb: String,
        /// Request path.
        path: String,
    },

    /// The resource is draining and accepts no new requests.
    #[error("Resource is shutting down")]
    ShuttingDown,

    /// No channel is available.
    #[error("Transport not connected")]
    NotConnected,

    /// An encoded frame exceeds the wire limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Encoded size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The peer sent something that breaks the framing protocol.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server answered the upgrade request with a non-101 status.
    #[error("HTTP error {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Reason text.
        message: String,
    },

    /// The server refused the credentials (401/403).
    #[error("Authentication rejected (status {status})")]
    AuthRejected {
        /// HTTP status code.
        status: u16,
    },

    /// The server invalidated this device.
    #[error("Device invalidated: {0}")]
    DeviceInvalidated(String),

    /// The manager was permanently expired.
    #[error("Channel manager expired: {0}")]
    Expired(String),

    /// The operation was cancelled by the caller.
    #[error("Operation aborted")]
    Aborted,

    /// An incoming request was already answered.
    #[error("Request already responded")]
    AlreadyResponded,

    /// No credentials are stored for an authenticated operation.
    #[error("Missing credentials")]
    MissingCredentials,

    /// URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A header line was malformed.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl NetworkError {
    /// Returns true when the server rejected the supplied credentials.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            NetworkError::AuthRejected { .. }
                | NetworkError::Http {
                    status: 401 | 403,
                    ..
                }
                | NetworkError::DeviceInvalidated(_)
        )
    }

    /// Returns true for failures worth retrying after a backoff delay.
    ///
    /// Server-side 5xx responses and transport-level failures qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            NetworkError::Http { status, .. } => (500..600).contains(status),
            NetworkError::ConnectionFailed(_)
            | NetworkError::ConnectionClosed
            | NetworkError::Timeout
            | NetworkError::Io(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Io(err.to_string())
    }
}

impl From<url::ParseError> for NetworkError {
    fn from(err: url::ParseError) -> Self {
        NetworkError::InvalidUrl(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_rejection_classification() {
        let unauthorized = NetworkError::Http {
            status: 401,
            message: "Unauthorized".into(),
        };
        let forbidden = NetworkError::Http {
            status: 403,
            message: "Forbidden".into(),
        };
        assert!(unauthorized.is_auth_rejection());
        assert!(forbidden.is_auth_rejection());
        assert!(NetworkError::AuthRejected { status: 401 }.is_auth_rejection());
        assert!(NetworkError::DeviceInvalidated("gone".into()).is_auth_rejection());
        assert!(!NetworkError::Timeout.is_auth_rejection());
    }

    #[test]
    fn test_transient_classification() {
        let server = NetworkError::Http {
            status: 502,
            message: "Bad Gateway".into(),
        };
        let client = NetworkError::Http {
            status: 404,
            message: "Not Found".into(),
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(NetworkError::Io("reset".into()).is_transient());
        assert!(!NetworkError::Aborted.is_transient());
    }
}
