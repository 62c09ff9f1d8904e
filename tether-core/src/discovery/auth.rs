// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Discovery Auth Cache
//!
//! Discovery credentials are fetched from an external provider and reused
//! until they age past the TTL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::error::DiscoveryResult;
use crate::network::Credentials;

/// How long fetched credentials are reused. Shorter than the 24h server-side
/// expiry to absorb clock skew.
pub const AUTH_TTL: Duration = Duration::from_secs(23 * 60 * 60);

/// Source of discovery credentials.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Fetches fresh credentials.
    async fn get_auth(&self) -> DiscoveryResult<Credentials>;
}

#[async_trait]
impl<T: AuthProvider + ?Sized> AuthProvider for Arc<T> {
    async fn get_auth(&self) -> DiscoveryResult<Credentials> {
        (**self).get_auth().await
    }
}

/// Credentials with the time they were fetched.
#[derive(Debug, Clone)]
pub struct CachedAuth {
    /// Cached credentials.
    pub auth: Credentials,
    /// Fetch time.
    pub timestamp: Instant,
}

impl CachedAuth {
    /// Returns true while the credentials are younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.timestamp.elapsed() < ttl
    }
}

/// TTL-checked credential cache owned by one requester.
#[derive(Debug)]
pub(crate) struct AuthCache {
    ttl: Duration,
    cached: Mutex<Option<CachedAuth>>,
}

impl AuthCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        AuthCache {
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub(crate) fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    /// Cached credentials if still fresh, otherwise a fresh fetch.
    pub(crate) async fn get(&self, provider: &dyn AuthProvider) -> DiscoveryResult<Credentials> {
        let cached = self.cached.lock().clone();
        if let Some(cached) = cached.filter(|cached| cached.is_fresh(self.ttl)) {
            return Ok(cached.auth);
        }

        debug!("Fetching discovery credentials");
        let auth = provider.get_auth().await?;
        *self.cached.lock() = Some(CachedAuth {
            auth: auth.clone(),
            timestamp: Instant::now(),
        });
        Ok(auth)
    }

    pub(crate) fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    pub(crate) fn snapshot(&self) -> Option<CachedAuth> {
        self.cached.lock().clone()
    }
}
