// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory enclaves for tests.
//!
//! [`MockEnclave`] plays the enclave side of [`EnclaveDiscovery`] over a
//! [`MockSocket`]; [`MockLegacyEnclave`] implements the legacy HTTP calls
//! with genuinely derived keys and a well-formed quote.
//!
//! [`EnclaveDiscovery`]: super::EnclaveDiscovery

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

use super::crypto::{open, random_bytes, seal, sha256, Role, SecretKey, SessionCipher, NONCE_LEN};
use super::enclave::{NORMAL_CLOSURE_CODE, RATE_LIMITED_CLOSE_CODE};
use super::error::{DiscoveryError, DiscoveryResult};
use super::legacy::attestation::{
    SignatureBody, EXPECTED_ADVISORY_ID, EXPECTED_QUOTE_STATUS, QUOTE_FLAGS_OFFSET, QUOTE_MIN_LEN,
    QUOTE_MRENCLAVE_OFFSET, QUOTE_REPORT_DATA_OFFSET, QUOTE_SIGNATURE_LEN_OFFSET,
    QUOTE_XFRM_OFFSET, SIGNATURE_BODY_VERSION,
};
use super::legacy::{
    derive_attestation_keys, split_tag, AttestationResponse, AttestationSignatureVerifier,
    LegacyDiscoveryRequest, LegacyDiscoveryResponse, LegacyDiscoveryTransport,
    PutAttestationResponse, PutAttestationResult,
};
use super::types::{decode_client_request, encode_triples, IdentityAccessPair, Triple, E164};
use crate::network::{ClientAction, Credentials, MockSocket};

fn violation(message: impl Into<String>) -> DiscoveryError {
    DiscoveryError::ProtocolViolation(message.into())
}

fn parse_e164(e164: &str) -> DiscoveryResult<E164> {
    e164.parse()
}

/// What the enclave received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedLookup {
    /// Version byte.
    pub version: u8,
    /// Requested numbers as `+digits`.
    pub e164s: Vec<String>,
    /// Identity/access-key pairs.
    pub pairs: Vec<IdentityAccessPair>,
}

/// Enclave side of the WebSocket discovery protocol.
pub struct MockEnclave {
    secret: StaticSecret,
    public: [u8; 32],
    directory: Mutex<HashMap<E164, (Option<Uuid>, Option<Uuid>)>>,
    triples_per_fragment: usize,
}

impl Default for MockEnclave {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEnclave {
    /// Creates an enclave with a fresh key and an empty directory.
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        MockEnclave {
            secret,
            public,
            directory: Mutex::new(HashMap::new()),
            triples_per_fragment: 1,
        }
    }

    /// The key clients must pin.
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Sets how many triples go in each response message.
    pub fn with_triples_per_fragment(mut self, count: usize) -> Self {
        self.triples_per_fragment = count.max(1);
        self
    }

    /// Adds a directory entry.
    pub fn register(
        &self,
        e164: &str,
        primary: Option<Uuid>,
        secondary: Option<Uuid>,
    ) -> DiscoveryResult<()> {
        self.directory
            .lock()
            .insert(parse_e164(e164)?, (primary, secondary));
        Ok(())
    }

    async fn expect_message(socket: &mut MockSocket) -> DiscoveryResult<Vec<u8>> {
        match socket.next_action().await {
            Some(ClientAction::Message(bytes)) => Ok(bytes),
            Some(ClientAction::Close { code, reason }) => Err(DiscoveryError::Closed { code, reason }),
            None => Err(violation("Client went away")),
        }
    }

    /// Runs the handshake and reads the request.
    pub async fn accept_lookup(
        &self,
        socket: &mut MockSocket,
    ) -> DiscoveryResult<(SessionHalf, ServedLookup)> {
        socket.send_bytes(self.public.to_vec());

        let client_public: [u8; 32] = Self::expect_message(socket)
            .await?
            .try_into()
            .map_err(|_| violation("Client key is not 32 bytes"))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(client_public));
        let mut cipher =
            SessionCipher::derive(Role::Server, shared.as_bytes(), &client_public, &self.public)?;

        let ciphertext = Self::expect_message(socket).await?;
        let (version, e164s, pairs) = decode_client_request(&cipher.decrypt(&ciphertext)?)?;
        let lookup = ServedLookup {
            version,
            e164s: e164s.iter().map(ToString::to_string).collect(),
            pairs,
        };
        Ok((SessionHalf { cipher, e164s }, lookup))
    }

    /// Answers one lookup from the directory and closes normally.
    pub async fn serve(&self, socket: &mut MockSocket) -> DiscoveryResult<ServedLookup> {
        let (mut half, lookup) = self.accept_lookup(socket).await?;
        let triples: Vec<Triple> = {
            let directory = self.directory.lock();
            half.e164s
                .iter()
                .filter_map(|e164| {
                    directory.get(e164).map(|&(primary, secondary)| Triple {
                        e164: *e164,
                        secondary,
                        primary,
                    })
                })
                .collect()
        };
        for fragment in triples.chunks(self.triples_per_fragment) {
            socket.send_bytes(half.cipher.encrypt(&encode_triples(fragment))?);
        }
        socket.close(NORMAL_CLOSURE_CODE, "");
        Ok(lookup)
    }

    /// Reads one lookup and refuses it with a rate limit.
    pub async fn serve_rate_limited(
        &self,
        socket: &mut MockSocket,
        retry_after: Duration,
    ) -> DiscoveryResult<ServedLookup> {
        let (_, lookup) = self.accept_lookup(socket).await?;
        socket.close(
            RATE_LIMITED_CLOSE_CODE,
            &format!(r#"{{"retry_after":{}}}"#, retry_after.as_secs()),
        );
        Ok(lookup)
    }
}

/// Enclave end of an established session.
pub struct SessionHalf {
    cipher: SessionCipher,
    e164s: Vec<E164>,
}

impl SessionHalf {
    /// Encrypts one response fragment.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> DiscoveryResult<Vec<u8>> {
        self.cipher.encrypt(plaintext)
    }
}

/// Verifier that accepts every signature. Pair it with [`MockLegacyEnclave`],
/// which cannot produce an Intel-signed report.
#[derive(Debug, Clone, Copy, Default)]
pub struct UncheckedSignatureVerifier;

impl AttestationSignatureVerifier for UncheckedSignatureVerifier {
    fn verify(&self, _signature: &[u8], _body: &[u8], _certificates: &str) -> DiscoveryResult<()> {
        Ok(())
    }
}

/// Legacy SGX service with real key agreement.
pub struct MockLegacyEnclave {
    enclave_id: [u8; 32],
    static_secret: StaticSecret,
    static_public: [u8; 32],
    attestation_count: Mutex<usize>,
    sessions: Mutex<HashMap<Vec<u8>, (SecretKey, SecretKey)>>,
    directory: Mutex<HashMap<E164, Uuid>>,
    cookies: Mutex<Vec<Option<String>>>,
}

impl MockLegacyEnclave {
    /// Creates a service measuring as `enclave_id`.
    pub fn new(enclave_id: [u8; 32]) -> Self {
        let static_secret = StaticSecret::random_from_rng(OsRng);
        let static_public = PublicKey::from(&static_secret).to_bytes();
        MockLegacyEnclave {
            enclave_id,
            static_secret,
            static_public,
            attestation_count: Mutex::new(1),
            sessions: Mutex::new(HashMap::new()),
            directory: Mutex::new(HashMap::new()),
            cookies: Mutex::new(Vec::new()),
        }
    }

    /// Measurement as hex, for the client configuration.
    pub fn enclave_id_hex(&self) -> String {
        hex::encode(self.enclave_id)
    }

    /// Number of attestations returned per handshake.
    pub fn set_attestation_count(&self, count: usize) {
        *self.attestation_count.lock() = count;
    }

    /// Adds a directory entry.
    pub fn register(&self, e164: &str, identity: Uuid) -> DiscoveryResult<()> {
        self.directory.lock().insert(parse_e164(e164)?, identity);
        Ok(())
    }

    /// Cookies received with each discovery call.
    pub fn received_cookies(&self) -> Vec<Option<String>> {
        self.cookies.lock().clone()
    }

    fn quote(&self) -> Vec<u8> {
        let mut quote = vec![0u8; QUOTE_MIN_LEN];
        quote[0] = 2;
        quote[QUOTE_FLAGS_OFFSET] = 0x05;
        quote[QUOTE_XFRM_OFFSET] = 0x03;
        quote[QUOTE_MRENCLAVE_OFFSET..QUOTE_MRENCLAVE_OFFSET + 32].copy_from_slice(&self.enclave_id);
        quote[QUOTE_REPORT_DATA_OFFSET..QUOTE_REPORT_DATA_OFFSET + 32]
            .copy_from_slice(&self.static_public);
        quote[QUOTE_SIGNATURE_LEN_OFFSET..QUOTE_MIN_LEN].copy_from_slice(&0u32.to_le_bytes());
        quote
    }

    fn attestation(&self, client_public: [u8; 32]) -> DiscoveryResult<AttestationResponse> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let client = PublicKey::from(client_public);
        let (client_key, server_key) = derive_attestation_keys(
            ephemeral.diffie_hellman(&client).as_bytes(),
            self.static_secret.diffie_hellman(&client).as_bytes(),
            &client_public,
            &ephemeral_public,
            &self.static_public,
        )?;

        let request_id: [u8; 16] = random_bytes()?;
        let iv: [u8; NONCE_LEN] = random_bytes()?;
        let sealed = seal(&server_key, iv, &[], &request_id)?;
        let (ciphertext, tag) = split_tag(&sealed);

        let quote = BASE64.encode(self.quote());
        let body = SignatureBody {
            timestamp: chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
            version: SIGNATURE_BODY_VERSION,
            isv_enclave_quote_body: quote.clone(),
            isv_enclave_quote_status: EXPECTED_QUOTE_STATUS.to_string(),
            advisory_ids: vec![EXPECTED_ADVISORY_ID.to_string()],
        };
        let signature_body =
            serde_json::to_string(&body).map_err(|e| violation(format!("Body: {}", e)))?;

        self.sessions
            .lock()
            .insert(request_id.to_vec(), (client_key, server_key));
        Ok(AttestationResponse {
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(iv),
            quote,
            server_ephemeral_public: BASE64.encode(ephemeral_public),
            server_static_public: BASE64.encode(self.static_public),
            signature: BASE64.encode(b"unsigned"),
            signature_body,
            tag: BASE64.encode(tag),
            certificates: String::new(),
        })
    }
}

fn decode(value: &str) -> DiscoveryResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| violation(format!("Bad base64: {}", e)))
}

fn nonce(value: &str) -> DiscoveryResult<[u8; NONCE_LEN]> {
    decode(value)?
        .try_into()
        .map_err(|_| violation("Nonce is not 12 bytes"))
}

fn sealed(data: &str, mac: &str) -> DiscoveryResult<Vec<u8>> {
    let mut sealed = decode(data)?;
    sealed.extend_from_slice(&decode(mac)?);
    Ok(sealed)
}

#[async_trait]
impl LegacyDiscoveryTransport for MockLegacyEnclave {
    async fn put_attestation(
        &self,
        _auth: &Credentials,
        public_key: [u8; 32],
    ) -> DiscoveryResult<PutAttestationResult> {
        let count = *self.attestation_count.lock();
        let attestations = (0..count)
            .map(|i| -> DiscoveryResult<_> {
                Ok((format!("enclave-{}", i), self.attestation(public_key)?))
            })
            .collect::<DiscoveryResult<HashMap<_, _>>>()?;
        Ok(PutAttestationResult {
            cookie: Some("session=mock".to_string()),
            response: PutAttestationResponse { attestations },
        })
    }

    async fn fetch_discovery_data(
        &self,
        _auth: &Credentials,
        request: &LegacyDiscoveryRequest,
        cookie: Option<&str>,
    ) -> DiscoveryResult<LegacyDiscoveryResponse> {
        self.cookies.lock().push(cookie.map(str::to_string));

        let (request_id, envelope, (client_key, server_key)) = {
            let sessions = self.sessions.lock();
            request
                .envelopes
                .values()
                .find_map(|envelope| {
                    let request_id = decode(&envelope.request_id).ok()?;
                    let keys = sessions.get(&request_id)?.clone();
                    Some((request_id, envelope.clone(), keys))
                })
                .ok_or_else(|| violation("No envelope for a known attestation"))?
        };

        let query_key: [u8; 32] = open(
            &client_key,
            nonce(&envelope.iv)?,
            &request_id,
            &sealed(&envelope.data, &envelope.mac)?,
        )?
        .try_into()
        .map_err(|_| violation("Query key is not 32 bytes"))?;
        let query = open(
            &SecretKey::from_bytes(query_key),
            nonce(&request.iv)?,
            &[],
            &sealed(&request.data, &request.mac)?,
        )?;

        if BASE64.encode(sha256(&query)) != request.commitment {
            return Err(violation("Commitment mismatch"));
        }
        let numbers = query
            .get(32..)
            .ok_or_else(|| violation("Query too short"))?;
        if numbers.len() % 8 != 0 || numbers.len() / 8 != request.address_count {
            return Err(violation("Address count mismatch"));
        }

        let mut plaintext = Vec::with_capacity(request.address_count * 16);
        {
            let directory = self.directory.lock();
            for block in numbers.chunks_exact(8) {
                let identity = block
                    .try_into()
                    .ok()
                    .and_then(E164::from_block)
                    .and_then(|e164| directory.get(&e164).copied())
                    .unwrap_or_default();
                plaintext.extend_from_slice(identity.as_bytes());
            }
        }

        let iv: [u8; NONCE_LEN] = random_bytes()?;
        let sealed_response = seal(&server_key, iv, &[], &plaintext)?;
        let (data, mac) = split_tag(&sealed_response);
        Ok(LegacyDiscoveryResponse {
            request_id,
            iv: iv.to_vec(),
            data: data.to_vec(),
            mac: mac.to_vec(),
        })
    }
}
