// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tether Core Library
//!
//! Client-side realtime transport: multiplexed request/response channels over
//! a single WebSocket, a channel manager with reconnection and backoff, and
//! contact discovery against a remote secure enclave.
//! All cryptographic operations use the audited `ring` crate.

pub mod discovery;
pub mod network;

pub use discovery::{
    DiscoveryError, DiscoveryRequest, DiscoveryResponse, DiscoveryResponseEntry,
    RateLimitedRequester,
};
pub use network::{
    ChannelManager, Credentials, FetchOptions, FetchResponse, NetworkError, Resource,
    ResourceConfig,
};
