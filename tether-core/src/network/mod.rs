// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Network + Transport Layer
//!
//! Multiplexes request/response traffic over a single WebSocket and keeps
//! the client's two long-lived channels alive.
//!
//! # Architecture
//!
//! The network layer consists of:
//! - **Frame codec**: Protobuf envelope for requests and responses
//! - **Dialer trait**: Platform-agnostic interface for opening sockets
//! - **Resource**: Request ids, in-flight tracking, timeouts and closing
//! - **Keepalive**: Liveness probes on quiet connections
//! - **Channel manager**: Authenticated and unauthenticated channels with
//!   reconnection, backoff and an online/offline view
//!
//! # Example
//!
//! ```ignore
//! use tether_core::network::{ChannelManager, Credentials, ManagerConfig, MockDialer};
//!
//! let dialer = MockDialer::new();
//! let manager = ChannelManager::new(ManagerConfig::new("https://chat.example.com", "1.0"), dialer);
//! manager.authenticate(Credentials::new("uuid.1", "secret")).await?;
//!
//! let resource = manager.get_authenticated_resource().await?;
//! let response = resource
//!     .send_request(SendRequestOptions::new("GET", "/v1/config"))
//!     .await?;
//! ```

pub mod backoff;

#[cfg(feature = "testing")]
pub mod credentials;
#[cfg(not(feature = "testing"))]
mod credentials;

#[cfg(feature = "testing")]
pub mod error;
#[cfg(not(feature = "testing"))]
mod error;

#[cfg(feature = "testing")]
pub mod events;
#[cfg(not(feature = "testing"))]
mod events;

#[cfg(feature = "testing")]
pub mod fetch;
#[cfg(not(feature = "testing"))]
mod fetch;

pub mod frame;

#[cfg(feature = "testing")]
pub mod keepalive;
#[cfg(not(feature = "testing"))]
mod keepalive;

#[cfg(feature = "testing")]
pub mod manager;
#[cfg(not(feature = "testing"))]
mod manager;

pub mod mock;

mod process;

#[cfg(feature = "testing")]
pub mod resource;
#[cfg(not(feature = "testing"))]
mod resource;

#[cfg(feature = "testing")]
pub mod transport;
#[cfg(not(feature = "testing"))]
mod transport;

#[cfg(any(feature = "network-native-tls", feature = "network-rustls"))]
mod websocket;

// Error types
pub use error::{NetworkError, NetworkResult};

// Frame codec
pub use frame::{decode_frame, encode_frame, Frame, RequestFrame, ResponseFrame, MAX_FRAME_SIZE};

// Transport abstraction
pub use transport::{
    ConnectRequest, Dialer, ProxyConfig, SocketCommand, SocketEvent, SocketHandle, SocketInfo,
    SocketStatus, ABNORMAL_CLOSURE_CODE, CONNECTED_ELSEWHERE_CODE, CONNECTION_INVALIDATED_CODE,
    NORMAL_DISCONNECT_CODE, UNEXPECTED_DISCONNECT_CODE,
};

// Reconnect delays
pub use backoff::{BackOff, DEFAULT_JITTER, EXTENDED_FIBONACCI_TIMEOUTS, FIBONACCI_TIMEOUTS};

// Manager events
pub use events::{CallbackHandler, ChannelKind, EventDispatcher, EventHandler, ManagerEvent};

// Multiplexed resource
pub use resource::{
    CloseEvent, IncomingRequest, IncomingRequestHandler, Resource, ResourceConfig,
    ResourceResponse, SendRequestOptions, ServerRequestType, DEFAULT_CLOSE_GRACE,
    DEFAULT_SHUTDOWN_TIMEOUT, MAX_REQUEST_ID, SHUTTING_DOWN_STATUS,
};

// Keepalive
pub use keepalive::{
    KeepAliveConfig, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT, MAX_HEALTHY_RESPONSE_TIME,
    STALE_THRESHOLD,
};

// Credentials and fetch
pub use credentials::Credentials;
pub use fetch::{FetchOptions, FetchResponse};

// Channel management
pub use manager::{
    ChannelManager, ExpirationReason, ManagerConfig, RequestHandler, SocketStatuses,
    OFFLINE_KEEPALIVE_TIMEOUT, UNAUTHENTICATED_ROTATION,
};

// Mock transport for testing
pub use mock::{ClientAction, MockDialer, MockSocket};

// WebSocket transport for production
#[cfg(any(feature = "network-native-tls", feature = "network-rustls"))]
pub use websocket::WebSocketDialer;
