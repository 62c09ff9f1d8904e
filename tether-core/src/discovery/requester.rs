// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rate-Limited Requester
//!
//! Wraps any [`DiscoveryVariant`] with batch validation, the credential
//! cache and the server-advertised cooldown. The variant only knows how to
//! talk to its enclave; the requester decides when it may.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::auth::{AuthCache, AuthProvider, CachedAuth, AUTH_TTL};
use super::error::{DiscoveryError, DiscoveryResult};
use super::types::{DiscoveryRequest, DiscoveryResponse, IdentityAccessPair, E164};
use crate::network::{Credentials, NetworkError};

/// A validated lookup, ready to be encoded by a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Version byte for the request.
    pub version: u8,
    /// Parsed numbers, in request order.
    pub e164s: Vec<E164>,
    /// Known identities.
    pub pairs: Vec<IdentityAccessPair>,
}

/// One enclave protocol family.
///
/// A lookup runs `connect`, `handshake`, `send_batch` and
/// `decrypt_response` in order on one session.
#[async_trait]
pub trait DiscoveryVariant: Send + Sync {
    /// Per-lookup connection state.
    type Session: Send;

    /// Opens a session with `auth`.
    async fn connect(&self, auth: &Credentials) -> DiscoveryResult<Self::Session>;

    /// Authenticates the enclave and agrees on keys.
    async fn handshake(&self, session: &mut Self::Session) -> DiscoveryResult<()>;

    /// Encrypts and sends the batch.
    async fn send_batch(&self, session: &mut Self::Session, batch: &Batch) -> DiscoveryResult<()>;

    /// Receives and decrypts the lookup result.
    async fn decrypt_response(
        &self,
        session: &mut Self::Session,
        batch: &Batch,
    ) -> DiscoveryResult<DiscoveryResponse>;
}

/// Runs lookups through a variant, honoring rate limits.
///
/// # Example
///
/// ```ignore
/// let requester = RateLimitedRequester::new(EnclaveDiscovery::new(config, dialer), provider);
/// let found = requester
///     .request(&DiscoveryRequest::new(["+15551234567"]))
///     .await?;
/// ```
pub struct RateLimitedRequester<V, A> {
    variant: V,
    auth: A,
    cache: AuthCache,
    retry_at: Mutex<Option<Instant>>,
    default_timeout: Option<Duration>,
}

impl<V, A> RateLimitedRequester<V, A>
where
    V: DiscoveryVariant,
    A: AuthProvider,
{
    /// Creates a requester with the default auth TTL and no deadline.
    pub fn new(variant: V, auth: A) -> Self {
        RateLimitedRequester {
            variant,
            auth,
            cache: AuthCache::new(AUTH_TTL),
            retry_at: Mutex::new(None),
            default_timeout: None,
        }
    }

    /// Overrides how long fetched credentials are reused.
    pub fn with_auth_ttl(mut self, ttl: Duration) -> Self {
        self.cache.set_ttl(ttl);
        self
    }

    /// Deadline for lookups that do not carry their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// The wrapped variant.
    pub fn variant(&self) -> &V {
        &self.variant
    }

    /// End of the current cooldown, if any.
    pub fn retry_at(&self) -> Option<Instant> {
        *self.retry_at.lock()
    }

    /// Currently cached credentials.
    pub fn cached_auth(&self) -> Option<CachedAuth> {
        self.cache.snapshot()
    }

    /// Looks up a batch.
    ///
    /// Oversized or malformed batches fail before any I/O. An active
    /// cooldown is waited out first. A `RateLimited` failure extends the
    /// cooldown for later calls.
    pub async fn request(&self, request: &DiscoveryRequest) -> DiscoveryResult<DiscoveryResponse> {
        let batch = Batch {
            version: request.version(),
            e164s: request.validate()?,
            pairs: request.identity_access_pairs.clone(),
        };

        self.wait_for_cooldown().await;
        let auth = self.cache.get(&self.auth).await?;

        let exchange = self.exchange(&auth, &batch);
        let result = match request.timeout.or(self.default_timeout) {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or(Err(DiscoveryError::Network(NetworkError::Timeout))),
            None => exchange.await,
        };

        match &result {
            Ok(response) => {
                debug!(requested = batch.e164s.len(), found = response.len(), "Discovery complete");
            }
            Err(DiscoveryError::RateLimited { retry_after }) => {
                self.record_retry_after(*retry_after);
            }
            Err(DiscoveryError::Network(error)) if error.is_auth_rejection() => {
                warn!("Discovery credentials rejected, dropping cache");
                self.cache.invalidate();
            }
            Err(error) => warn!(error = %error, "Discovery failed"),
        }
        result
    }

    async fn exchange(
        &self,
        auth: &Credentials,
        batch: &Batch,
    ) -> DiscoveryResult<DiscoveryResponse> {
        let mut session = self.variant.connect(auth).await?;
        self.variant.handshake(&mut session).await?;
        self.variant.send_batch(&mut session, batch).await?;
        self.variant.decrypt_response(&mut session, batch).await
    }

    async fn wait_for_cooldown(&self) {
        loop {
            let current = *self.retry_at.lock();
            let deadline = match current {
                Some(deadline) if deadline > Instant::now() => deadline,
                _ => return,
            };
            info!(
                wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Waiting for discovery cooldown"
            );
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Overlapping cooldowns keep the later deadline.
    fn record_retry_after(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut retry_at = self.retry_at.lock();
        let next = match *retry_at {
            Some(existing) => existing.max(until),
            None => until,
        };
        warn!(retry_after_secs = retry_after.as_secs(), "Discovery rate limited");
        *retry_at = Some(next);
    }
}
