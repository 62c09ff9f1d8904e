// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Enclave Discovery
//!
//! Maps phone numbers to account identities by asking a remote secure
//! enclave, without revealing the numbers to anything outside it.
//!
//! # Architecture
//!
//! - **Requester**: Validation, auth caching, rate-limit cooldown and
//!   timeouts shared by every variant
//! - **Enclave variant**: WebSocket session with a pinned enclave key
//! - **Legacy variant**: SGX quote attestation over HTTP calls
//!
//! # Example
//!
//! ```ignore
//! use tether_core::discovery::{DiscoveryConfig, DiscoveryRequest, EnclaveDiscovery};
//!
//! let discovery = EnclaveDiscovery::new(config, dialer).into_requester(auth_provider);
//! let response = discovery
//!     .request(&DiscoveryRequest::new(["+15551234567"]))
//!     .await?;
//! ```

#[cfg(feature = "testing")]
pub mod auth;
#[cfg(not(feature = "testing"))]
mod auth;

mod crypto;

#[cfg(feature = "testing")]
pub mod enclave;
#[cfg(not(feature = "testing"))]
mod enclave;

#[cfg(feature = "testing")]
pub mod error;
#[cfg(not(feature = "testing"))]
mod error;

pub mod legacy;
pub mod mock;

#[cfg(feature = "testing")]
pub mod requester;
#[cfg(not(feature = "testing"))]
mod requester;

#[cfg(feature = "testing")]
pub mod types;
#[cfg(not(feature = "testing"))]
mod types;

// Errors
pub use error::{DiscoveryError, DiscoveryResult};

// Request and response
pub use types::{
    DiscoveryRequest, DiscoveryResponse, DiscoveryResponseEntry, IdentityAccessPair, Triple,
    E164, E164_BLOCK_LEN, MAX_E164_COUNT, REQUEST_VERSION, REQUEST_VERSION_WITH_PAIRS,
    TRIPLE_LEN,
};

// Requester
pub use auth::{AuthProvider, CachedAuth, AUTH_TTL};
pub use requester::{Batch, DiscoveryVariant, RateLimitedRequester};

// Variants
pub use enclave::{
    DiscoveryConfig, EnclaveDiscovery, EnclaveSession, NORMAL_CLOSURE_CODE,
    POLICY_VIOLATION_CODE, RATE_LIMITED_CLOSE_CODE,
};
pub use legacy::{
    AttestationResponse, AttestationSignatureVerifier, LegacyDiscovery, LegacyDiscoveryConfig,
    LegacyDiscoveryRequest, LegacyDiscoveryResponse, LegacyDiscoveryTransport,
    PutAttestationResponse, PutAttestationResult, X509SignatureVerifier, MAX_ATTESTATIONS,
};

// Mock implementations (for testing)
pub use mock::{MockEnclave, MockLegacyEnclave, ServedLookup, UncheckedSignatureVerifier};
