// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Legacy SGX Discovery
//!
//! Lookup against the attested SGX directory service over plain HTTP calls
//! supplied by a [`LegacyDiscoveryTransport`]:
//!
//! 1. `put_attestation` with a fresh X25519 public key returns one to three
//!    attestations. Each is checked (quote, signed body, signature chain)
//!    and yields a client key, a server key and a request id.
//! 2. The numbers are encrypted once under a random query key; the query key
//!    is wrapped for every attestation with its client key.
//! 3. The response is decrypted with the server key of the attestation whose
//!    request id it echoes, and split into 16-byte identities matched to the
//!    input numbers by position.

pub mod attestation;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use super::crypto::{
    constant_time_eq, derive_key_pair, open, random_bytes, seal, sha256, SecretKey, NONCE_LEN,
    TAG_LEN,
};
use super::error::{DiscoveryError, DiscoveryResult};
use super::requester::{Batch, DiscoveryVariant};
use super::types::{DiscoveryResponse, DiscoveryResponseEntry};
use crate::network::Credentials;

pub use attestation::{
    validate_quote, validate_signature_body, AttestationSignatureVerifier, SignatureBody,
    X509SignatureVerifier,
};

/// Most attestations a server may return.
pub const MAX_ATTESTATIONS: usize = 3;

/// Legacy discovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyDiscoveryConfig {
    /// Hex enclave measurement (mrenclave).
    pub enclave_id: String,
    /// PEM trust anchor for the attestation signing chain.
    pub trust_anchor: String,
}

/// One attestation as sent by the server. Byte fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationResponse {
    /// Encrypted request id.
    pub ciphertext: String,
    /// Nonce for `ciphertext`.
    pub iv: String,
    /// SGX quote.
    pub quote: String,
    /// Server ephemeral X25519 key.
    pub server_ephemeral_public: String,
    /// Server static X25519 key, bound into the quote.
    pub server_static_public: String,
    /// RSA signature over `signature_body`.
    pub signature: String,
    /// JSON [`SignatureBody`], signed verbatim.
    pub signature_body: String,
    /// GCM tag for `ciphertext`.
    pub tag: String,
    /// PEM chain, leaf first.
    pub certificates: String,
}

/// Body of a `put_attestation` answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAttestationResponse {
    /// Attestations keyed by server-chosen name.
    pub attestations: HashMap<String, AttestationResponse>,
}

/// A `put_attestation` answer with its session cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutAttestationResult {
    /// Cookie to send with the discovery call.
    pub cookie: Option<String>,
    /// Response body.
    pub response: PutAttestationResponse,
}

/// Query key wrapped for one attestation. Byte fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEnvelope {
    /// Attestation request id, also the AAD.
    pub request_id: String,
    /// Encrypted query key.
    pub data: String,
    /// Nonce.
    pub iv: String,
    /// GCM tag.
    pub mac: String,
}

/// Encrypted lookup body. Byte fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDiscoveryRequest {
    /// Number of phone numbers in the query.
    pub address_count: usize,
    /// SHA-256 of the query plaintext.
    pub commitment: String,
    /// Encrypted query.
    pub data: String,
    /// Query nonce.
    pub iv: String,
    /// Query GCM tag.
    pub mac: String,
    /// Wrapped query keys keyed like the attestations.
    pub envelopes: HashMap<String, DiscoveryEnvelope>,
}

/// Encrypted lookup answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyDiscoveryResponse {
    /// Request id of the attestation the server used.
    pub request_id: Vec<u8>,
    /// Nonce.
    pub iv: Vec<u8>,
    /// Ciphertext.
    pub data: Vec<u8>,
    /// GCM tag.
    pub mac: Vec<u8>,
}

/// HTTP calls of the legacy service.
#[async_trait]
pub trait LegacyDiscoveryTransport: Send + Sync {
    /// Submits the client public key and returns the attestations.
    async fn put_attestation(
        &self,
        auth: &Credentials,
        public_key: [u8; 32],
    ) -> DiscoveryResult<PutAttestationResult>;

    /// Submits the encrypted lookup.
    async fn fetch_discovery_data(
        &self,
        auth: &Credentials,
        request: &LegacyDiscoveryRequest,
        cookie: Option<&str>,
    ) -> DiscoveryResult<LegacyDiscoveryResponse>;
}

#[async_trait]
impl<T: LegacyDiscoveryTransport + ?Sized> LegacyDiscoveryTransport for Arc<T> {
    async fn put_attestation(
        &self,
        auth: &Credentials,
        public_key: [u8; 32],
    ) -> DiscoveryResult<PutAttestationResult> {
        (**self).put_attestation(auth, public_key).await
    }

    async fn fetch_discovery_data(
        &self,
        auth: &Credentials,
        request: &LegacyDiscoveryRequest,
        cookie: Option<&str>,
    ) -> DiscoveryResult<LegacyDiscoveryResponse> {
        (**self).fetch_discovery_data(auth, request, cookie).await
    }
}

/// Keys agreed with one attested enclave instance.
struct Attestation {
    client_key: SecretKey,
    server_key: SecretKey,
    request_id: Vec<u8>,
}

/// State of one legacy lookup.
pub struct LegacySession {
    auth: Credentials,
    cookie: Option<String>,
    attestations: Vec<(String, Attestation)>,
    response: Option<LegacyDiscoveryResponse>,
}

/// Legacy SGX discovery.
pub struct LegacyDiscovery<T, S = X509SignatureVerifier> {
    enclave_id: Vec<u8>,
    transport: T,
    verifier: S,
}

impl<T: LegacyDiscoveryTransport> LegacyDiscovery<T> {
    /// Creates the variant, verifying signatures against the configured
    /// trust anchor.
    pub fn new(config: &LegacyDiscoveryConfig, transport: T) -> DiscoveryResult<Self> {
        let verifier = X509SignatureVerifier::new(&config.trust_anchor)?;
        Self::with_verifier(config, transport, verifier)
    }
}

impl<T, S> LegacyDiscovery<T, S>
where
    T: LegacyDiscoveryTransport,
    S: AttestationSignatureVerifier,
{
    /// Creates the variant with a custom signature verifier.
    pub fn with_verifier(
        config: &LegacyDiscoveryConfig,
        transport: T,
        verifier: S,
    ) -> DiscoveryResult<Self> {
        let enclave_id = hex::decode(&config.enclave_id)
            .map_err(|e| DiscoveryError::AttestationInvalid(format!("Bad enclave id: {}", e)))?;
        if enclave_id.len() != 32 {
            return Err(DiscoveryError::AttestationInvalid(format!(
                "Enclave id must be 32 bytes, got {}",
                enclave_id.len()
            )));
        }
        Ok(LegacyDiscovery {
            enclave_id,
            transport,
            verifier,
        })
    }

    /// Checks one attestation and derives its keys.
    fn accept_attestation(
        &self,
        secret: &StaticSecret,
        client_public: &PublicKey,
        attestation: &AttestationResponse,
    ) -> DiscoveryResult<Attestation> {
        let quote = decode_field("quote", &attestation.quote)?;
        let server_ephemeral = decode_key("serverEphemeralPublic", &attestation.server_ephemeral_public)?;
        let server_static = decode_key("serverStaticPublic", &attestation.server_static_public)?;

        validate_quote(&quote, &server_static, &self.enclave_id)?;
        let body: SignatureBody = serde_json::from_str(&attestation.signature_body)
            .map_err(|e| DiscoveryError::AttestationInvalid(format!("Bad signature body: {}", e)))?;
        validate_signature_body(&body, &attestation.quote, chrono::Utc::now())?;
        self.verifier.verify(
            &decode_field("signature", &attestation.signature)?,
            attestation.signature_body.as_bytes(),
            &attestation.certificates,
        )?;

        let ephemeral_to_ephemeral = secret.diffie_hellman(&PublicKey::from(server_ephemeral));
        let ephemeral_to_static = secret.diffie_hellman(&PublicKey::from(server_static));
        let (client_key, server_key) = derive_attestation_keys(
            ephemeral_to_ephemeral.as_bytes(),
            ephemeral_to_static.as_bytes(),
            client_public.as_bytes(),
            &server_ephemeral,
            &server_static,
        )?;

        let mut ciphertext = decode_field("ciphertext", &attestation.ciphertext)?;
        ciphertext.extend_from_slice(&decode_field("tag", &attestation.tag)?);
        let iv = decode_nonce("iv", &attestation.iv)?;
        let request_id = open(&server_key, iv, &[], &ciphertext)?;

        Ok(Attestation {
            client_key,
            server_key,
            request_id,
        })
    }
}

/// HKDF over both agreements; salt is every public key involved.
pub(crate) fn derive_attestation_keys(
    ephemeral_to_ephemeral: &[u8; 32],
    ephemeral_to_static: &[u8; 32],
    client_public: &[u8; 32],
    server_ephemeral: &[u8; 32],
    server_static: &[u8; 32],
) -> DiscoveryResult<(SecretKey, SecretKey)> {
    let mut master = [0u8; 64];
    master[..32].copy_from_slice(ephemeral_to_ephemeral);
    master[32..].copy_from_slice(ephemeral_to_static);
    let mut public_keys = Vec::with_capacity(96);
    public_keys.extend_from_slice(client_public);
    public_keys.extend_from_slice(server_ephemeral);
    public_keys.extend_from_slice(server_static);
    let keys = derive_key_pair(&master, &public_keys, &[]);
    zeroize::Zeroize::zeroize(&mut master);
    keys
}

fn decode_field(name: &str, value: &str) -> DiscoveryResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| DiscoveryError::AttestationInvalid(format!("Bad base64 in {}: {}", name, e)))
}

fn decode_key(name: &str, value: &str) -> DiscoveryResult<[u8; 32]> {
    decode_field(name, value)?
        .try_into()
        .map_err(|_| DiscoveryError::AttestationInvalid(format!("{} is not 32 bytes", name)))
}

fn decode_nonce(name: &str, value: &str) -> DiscoveryResult<[u8; NONCE_LEN]> {
    decode_field(name, value)?
        .try_into()
        .map_err(|_| DiscoveryError::AttestationInvalid(format!("{} is not 12 bytes", name)))
}

/// Splits `ciphertext || tag` into its parts.
pub(crate) fn split_tag(sealed: &[u8]) -> (&[u8], &[u8]) {
    sealed.split_at(sealed.len().saturating_sub(TAG_LEN))
}

/// Splits a decrypted response into identities. Nil means not found.
pub(crate) fn split_identities(plaintext: &[u8]) -> DiscoveryResult<Vec<Option<Uuid>>> {
    if plaintext.len() % 16 != 0 {
        return Err(DiscoveryError::ProtocolViolation(format!(
            "Response of {} bytes is not a list of identities",
            plaintext.len()
        )));
    }
    Ok(plaintext
        .chunks_exact(16)
        .map(|chunk| Uuid::from_slice(chunk).ok().filter(|uuid| !uuid.is_nil()))
        .collect())
}

#[async_trait]
impl<T, S> DiscoveryVariant for LegacyDiscovery<T, S>
where
    T: LegacyDiscoveryTransport,
    S: AttestationSignatureVerifier,
{
    type Session = LegacySession;

    async fn connect(&self, auth: &Credentials) -> DiscoveryResult<LegacySession> {
        Ok(LegacySession {
            auth: auth.clone(),
            cookie: None,
            attestations: Vec::new(),
            response: None,
        })
    }

    async fn handshake(&self, session: &mut LegacySession) -> DiscoveryResult<()> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&secret);
        let result = self
            .transport
            .put_attestation(&session.auth, client_public.to_bytes())
            .await?;

        let count = result.response.attestations.len();
        if count == 0 {
            return Err(DiscoveryError::ProtocolViolation(
                "Got no attestations from the discovery service".into(),
            ));
        }
        if count > MAX_ATTESTATIONS {
            return Err(DiscoveryError::ProtocolViolation(format!(
                "Got {} attestations, at most {} allowed",
                count, MAX_ATTESTATIONS
            )));
        }

        for (name, attestation) in &result.response.attestations {
            let accepted = self.accept_attestation(&secret, &client_public, attestation)?;
            session.attestations.push((name.clone(), accepted));
        }
        session.cookie = result.cookie;
        info!(attestations = count, "Discovery enclave attested");
        Ok(())
    }

    async fn send_batch(&self, session: &mut LegacySession, batch: &Batch) -> DiscoveryResult<()> {
        if !batch.pairs.is_empty() {
            debug!(pairs = batch.pairs.len(), "Legacy discovery ignores identity pairs");
        }

        let nonce: [u8; 32] = random_bytes()?;
        let mut plaintext = Vec::with_capacity(32 + batch.e164s.len() * 8);
        plaintext.extend_from_slice(&nonce);
        for e164 in &batch.e164s {
            plaintext.extend_from_slice(&e164.to_block());
        }

        let query_key = SecretKey::generate()?;
        let commitment = sha256(&plaintext);
        let iv: [u8; NONCE_LEN] = random_bytes()?;
        let sealed = seal(&query_key, iv, &[], &plaintext)?;
        let (data, mac) = split_tag(&sealed);

        let mut envelopes = HashMap::with_capacity(session.attestations.len());
        for (name, attestation) in &session.attestations {
            let envelope_iv: [u8; NONCE_LEN] = random_bytes()?;
            let wrapped = seal(
                &attestation.client_key,
                envelope_iv,
                &attestation.request_id,
                query_key.as_bytes(),
            )?;
            let (wrapped_data, wrapped_mac) = split_tag(&wrapped);
            envelopes.insert(
                name.clone(),
                DiscoveryEnvelope {
                    request_id: BASE64.encode(&attestation.request_id),
                    data: BASE64.encode(wrapped_data),
                    iv: BASE64.encode(envelope_iv),
                    mac: BASE64.encode(wrapped_mac),
                },
            );
        }

        let request = LegacyDiscoveryRequest {
            address_count: batch.e164s.len(),
            commitment: BASE64.encode(commitment),
            data: BASE64.encode(data),
            iv: BASE64.encode(iv),
            mac: BASE64.encode(mac),
            envelopes,
        };
        let response = self
            .transport
            .fetch_discovery_data(&session.auth, &request, session.cookie.as_deref())
            .await?;
        session.response = Some(response);
        Ok(())
    }

    async fn decrypt_response(
        &self,
        session: &mut LegacySession,
        batch: &Batch,
    ) -> DiscoveryResult<DiscoveryResponse> {
        let response = session
            .response
            .take()
            .ok_or_else(|| DiscoveryError::ProtocolViolation("No discovery response".into()))?;
        let (_, attestation) = session
            .attestations
            .iter()
            .find(|(_, attestation)| constant_time_eq(&attestation.request_id, &response.request_id))
            .ok_or_else(|| {
                DiscoveryError::ProtocolViolation("No known attestation returned".into())
            })?;

        let iv: [u8; NONCE_LEN] = response
            .iv
            .as_slice()
            .try_into()
            .map_err(|_| DiscoveryError::Crypto("Response nonce is not 12 bytes".into()))?;
        let mut sealed = response.data;
        sealed.extend_from_slice(&response.mac);
        let plaintext = open(&attestation.server_key, iv, &[], &sealed)?;

        let identities = split_identities(&plaintext)?;
        if identities.len() != batch.e164s.len() {
            return Err(DiscoveryError::ProtocolViolation(format!(
                "Got {} identities for {} numbers",
                identities.len(),
                batch.e164s.len()
            )));
        }

        Ok(batch
            .e164s
            .iter()
            .zip(identities)
            .map(|(e164, identity)| {
                (
                    e164.to_string(),
                    DiscoveryResponseEntry {
                        primary_identity: identity,
                        secondary_identity: None,
                    },
                )
            })
            .collect())
    }
}
