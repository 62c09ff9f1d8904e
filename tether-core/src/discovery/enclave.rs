// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Enclave Discovery
//!
//! Lookup against an enclave reached over a WebSocket:
//!
//! 1. Dial `{base}/v1/{mrenclave}/discovery` with basic auth.
//! 2. The enclave sends its 32-byte X25519 key, which must match the pinned
//!    key. The client answers with an ephemeral public key.
//! 3. Both sides derive per-direction AES-256-GCM keys.
//! 4. The client sends one encrypted request; the enclave streams encrypted
//!    response fragments and closes with 1000, or with 4008 and a JSON
//!    `retry_after` when rate limiting.

use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use serde::Deserialize;
use tracing::{debug, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::auth::{AuthProvider, AUTH_TTL};
use super::crypto::{constant_time_eq, Role, SessionCipher};
use super::error::{DiscoveryError, DiscoveryResult};
use super::requester::{Batch, DiscoveryVariant, RateLimitedRequester};
use super::types::{collect_triples, decode_triples, encode_client_request, DiscoveryResponse};
use crate::network::{
    ConnectRequest, Credentials, Dialer, NetworkError, ProxyConfig, SocketEvent, SocketHandle,
};

/// Normal end of a lookup.
pub const NORMAL_CLOSURE_CODE: u16 = 1000;

/// Client closes with this when the enclave misbehaves.
pub const POLICY_VIOLATION_CODE: u16 = 1008;

/// The enclave refuses the lookup; the reason carries `retry_after`.
pub const RATE_LIMITED_CLOSE_CODE: u16 = 4008;

/// Enclave discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Service URL (`wss://...`).
    pub base_url: String,
    /// Pinned X25519 key of the enclave.
    pub public_key: [u8; 32],
    /// Hex enclave measurement, part of the URL.
    pub mrenclave: String,
    /// Proxy to tunnel through.
    pub proxy: ProxyConfig,
    /// Additional trusted root certificate (PEM).
    pub certificate_authority: Option<String>,
    /// Deadline for opening the socket.
    pub connect_timeout: Duration,
    /// How long fetched credentials are reused.
    pub auth_ttl: Duration,
    /// Deadline for lookups that do not carry their own.
    pub request_timeout: Option<Duration>,
}

impl DiscoveryConfig {
    /// Settings for the enclave at `base_url`.
    pub fn new(base_url: &str, public_key: [u8; 32], mrenclave: &str) -> Self {
        DiscoveryConfig {
            base_url: base_url.to_string(),
            public_key,
            mrenclave: mrenclave.to_string(),
            proxy: ProxyConfig::None,
            certificate_authority: None,
            connect_timeout: Duration::from_secs(30),
            auth_ttl: AUTH_TTL,
            request_timeout: None,
        }
    }

    fn discovery_url(&self) -> DiscoveryResult<String> {
        let base = url::Url::parse(&self.base_url).map_err(NetworkError::from)?;
        let url = base
            .join(&format!("/v1/{}/discovery", self.mrenclave))
            .map_err(NetworkError::from)?;
        Ok(url.into())
    }
}

/// Enclave discovery over a [`Dialer`].
pub struct EnclaveDiscovery<D> {
    config: DiscoveryConfig,
    dialer: D,
}

impl<D: Dialer> EnclaveDiscovery<D> {
    /// Creates the variant.
    pub fn new(config: DiscoveryConfig, dialer: D) -> Self {
        EnclaveDiscovery { config, dialer }
    }

    /// Settings in use.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Wraps the variant in a requester configured from the settings.
    pub fn into_requester<A: AuthProvider>(self, auth: A) -> RateLimitedRequester<Self, A> {
        let ttl = self.config.auth_ttl;
        let timeout = self.config.request_timeout;
        let requester = RateLimitedRequester::new(self, auth).with_auth_ttl(ttl);
        match timeout {
            Some(timeout) => requester.with_default_timeout(timeout),
            None => requester,
        }
    }
}

/// State of one lookup.
pub struct EnclaveSession {
    socket: SocketHandle,
    cipher: Option<SessionCipher>,
}

impl EnclaveSession {
    fn cipher(&mut self) -> DiscoveryResult<&mut SessionCipher> {
        self.cipher
            .as_mut()
            .ok_or_else(|| DiscoveryError::Handshake("Session has no keys".into()))
    }

    fn abort(&self, reason: &str) {
        self.socket.close(POLICY_VIOLATION_CODE, reason);
    }

    /// Next binary message. A close before it is an error.
    async fn next_message(&mut self) -> DiscoveryResult<Vec<u8>> {
        loop {
            match self.socket.recv().await {
                Some(SocketEvent::Message(bytes)) => return Ok(bytes),
                Some(SocketEvent::Error(error)) => warn!(error = %error, "Discovery socket error"),
                Some(SocketEvent::Closed { code, reason }) => {
                    return Err(close_error(code, &reason))
                }
                None => return Err(NetworkError::ConnectionClosed.into()),
            }
        }
    }
}

#[derive(Deserialize)]
struct RateLimitReason {
    retry_after: u64,
}

fn close_error(code: u16, reason: &str) -> DiscoveryError {
    if code == RATE_LIMITED_CLOSE_CODE {
        return match serde_json::from_str::<RateLimitReason>(reason) {
            Ok(parsed) => DiscoveryError::RateLimited {
                retry_after: Duration::from_secs(parsed.retry_after),
            },
            Err(e) => DiscoveryError::ProtocolViolation(format!(
                "Unparseable rate limit reason: {}",
                e
            )),
        };
    }
    DiscoveryError::Closed {
        code,
        reason: reason.to_string(),
    }
}

#[async_trait]
impl<D: Dialer> DiscoveryVariant for EnclaveDiscovery<D> {
    type Session = EnclaveSession;

    async fn connect(&self, auth: &Credentials) -> DiscoveryResult<EnclaveSession> {
        let request = ConnectRequest {
            url: self.config.discovery_url()?,
            headers: vec![("Authorization".to_string(), auth.basic_auth_header())],
            proxy: self.config.proxy.clone(),
            certificate_authority: self.config.certificate_authority.clone(),
            connect_timeout: self.config.connect_timeout,
        };
        let socket = tokio::time::timeout(self.config.connect_timeout, self.dialer.connect(request))
            .await
            .map_err(|_| NetworkError::Timeout)??;
        debug!("Discovery socket open");
        Ok(EnclaveSession {
            socket,
            cipher: None,
        })
    }

    async fn handshake(&self, session: &mut EnclaveSession) -> DiscoveryResult<()> {
        let server_key = session.next_message().await?;
        if !constant_time_eq(&server_key, &self.config.public_key) {
            session.abort("Unexpected enclave key");
            return Err(DiscoveryError::Handshake(
                "Enclave key does not match the pinned key".into(),
            ));
        }
        let server_public = self.config.public_key;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&secret);
        session.socket.send(client_public.as_bytes().to_vec())?;

        let shared = secret.diffie_hellman(&PublicKey::from(server_public));
        if !shared.was_contributory() {
            session.abort("Non-contributory key");
            return Err(DiscoveryError::Handshake("Non-contributory key agreement".into()));
        }
        session.cipher = Some(SessionCipher::derive(
            Role::Client,
            shared.as_bytes(),
            client_public.as_bytes(),
            &server_public,
        )?);
        debug!("Discovery handshake complete");
        Ok(())
    }

    async fn send_batch(&self, session: &mut EnclaveSession, batch: &Batch) -> DiscoveryResult<()> {
        let plaintext = encode_client_request(batch.version, &batch.e164s, &batch.pairs);
        let ciphertext = session.cipher()?.encrypt(&plaintext)?;
        session.socket.send(ciphertext)?;
        Ok(())
    }

    async fn decrypt_response(
        &self,
        session: &mut EnclaveSession,
        batch: &Batch,
    ) -> DiscoveryResult<DiscoveryResponse> {
        let mut response = DiscoveryResponse::with_capacity(batch.e164s.len());
        loop {
            match session.socket.recv().await {
                Some(SocketEvent::Message(fragment)) => {
                    let plaintext = match session.cipher()?.decrypt(&fragment) {
                        Ok(plaintext) => plaintext,
                        Err(e) => {
                            session.abort("Undecryptable fragment");
                            return Err(e);
                        }
                    };
                    collect_triples(&mut response, decode_triples(&plaintext)?);
                }
                Some(SocketEvent::Error(error)) => warn!(error = %error, "Discovery socket error"),
                Some(SocketEvent::Closed { code, .. }) if code == NORMAL_CLOSURE_CODE => {
                    info!(found = response.len(), "Discovery response received");
                    return Ok(response);
                }
                Some(SocketEvent::Closed { code, reason }) => return Err(close_error(code, &reason)),
                None => return Err(NetworkError::ConnectionClosed.into()),
            }
        }
    }
}
