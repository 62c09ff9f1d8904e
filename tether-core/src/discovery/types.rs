// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Discovery Request and Response Types
//!
//! Wire layout of a lookup request: one version byte followed by a protobuf
//! `ClientRequest`. Numbers are packed as 8-byte big-endian blocks; version 2
//! adds 32-byte (identity, access key) pairs. Responses are a stream of
//! 40-byte triples `(e164, secondary identity, primary identity)`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use prost::Message;
use uuid::Uuid;

use super::error::{DiscoveryError, DiscoveryResult};

/// Largest batch the protocol accepts. There is no paging.
pub const MAX_E164_COUNT: usize = 5000;

/// Request version without identity/access-key pairs.
pub const REQUEST_VERSION: u8 = 1;

/// Request version carrying identity/access-key pairs.
pub const REQUEST_VERSION_WITH_PAIRS: u8 = 2;

/// Size of one packed phone number.
pub const E164_BLOCK_LEN: usize = 8;

/// Size of one response triple.
pub const TRIPLE_LEN: usize = E164_BLOCK_LEN + 16 + 16;

const PAIR_LEN: usize = 32;
const MAX_E164_DIGITS: usize = 15;

/// A phone number in E.164 form, stored as its numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct E164(u64);

impl E164 {
    /// Numeric value.
    pub fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn from_block(block: [u8; E164_BLOCK_LEN]) -> Option<Self> {
        match u64::from_be_bytes(block) {
            0 => None,
            value => Some(E164(value)),
        }
    }

    pub(crate) fn to_block(self) -> [u8; E164_BLOCK_LEN] {
        self.0.to_be_bytes()
    }
}

impl FromStr for E164 {
    type Err = DiscoveryError;

    /// Accepts digits with or without a leading `+`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('+').unwrap_or(s);
        if digits.is_empty()
            || digits.len() > MAX_E164_DIGITS
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(DiscoveryError::InvalidE164(s.to_string()));
        }
        match digits.parse::<u64>() {
            Ok(0) | Err(_) => Err(DiscoveryError::InvalidE164(s.to_string())),
            Ok(value) => Ok(E164(value)),
        }
    }
}

impl fmt::Display for E164 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}", self.0)
    }
}

/// An identity together with the access key that proves the caller may see
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityAccessPair {
    /// Known identity.
    pub identity: Uuid,
    /// Access key for that identity.
    pub access_key: [u8; 16],
}

/// A batched lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryRequest {
    /// Phone numbers to look up.
    pub e164s: Vec<String>,
    /// Identities the caller already knows.
    pub identity_access_pairs: Vec<IdentityAccessPair>,
    /// Deadline for the whole exchange.
    pub timeout: Option<Duration>,
}

impl DiscoveryRequest {
    /// Lookup for `e164s`.
    pub fn new<I, S>(e164s: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DiscoveryRequest {
            e164s: e164s.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Adds a known identity.
    pub fn with_pair(mut self, identity: Uuid, access_key: [u8; 16]) -> Self {
        self.identity_access_pairs.push(IdentityAccessPair {
            identity,
            access_key,
        });
        self
    }

    /// Sets the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Checks the batch size and parses every number.
    ///
    /// Runs before any I/O so oversized or malformed batches never reach the
    /// network.
    pub fn validate(&self) -> DiscoveryResult<Vec<E164>> {
        if self.e164s.len() > MAX_E164_COUNT {
            return Err(DiscoveryError::BatchTooLarge {
                count: self.e164s.len(),
                max: MAX_E164_COUNT,
            });
        }
        self.e164s.iter().map(|s| s.parse()).collect()
    }

    /// Protocol version byte for this request.
    pub fn version(&self) -> u8 {
        if self.identity_access_pairs.is_empty() {
            REQUEST_VERSION
        } else {
            REQUEST_VERSION_WITH_PAIRS
        }
    }
}

/// Lookup result for one number. Both fields absent means not found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryResponseEntry {
    /// Account identity.
    pub primary_identity: Option<Uuid>,
    /// Phone-number identity.
    pub secondary_identity: Option<Uuid>,
}

impl DiscoveryResponseEntry {
    /// Returns true when the service knew nothing about the number.
    pub fn is_empty(&self) -> bool {
        self.primary_identity.is_none() && self.secondary_identity.is_none()
    }
}

/// Lookup results keyed by `+digits`.
pub type DiscoveryResponse = HashMap<String, DiscoveryResponseEntry>;

#[derive(Clone, PartialEq, Message)]
struct ClientRequest {
    #[prost(bytes = "vec", tag = "1")]
    e164_blocks: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    identity_access_pairs: Vec<u8>,
}

/// Serializes a lookup: version byte, then the protobuf payload.
pub(crate) fn encode_client_request(
    version: u8,
    e164s: &[E164],
    pairs: &[IdentityAccessPair],
) -> Vec<u8> {
    let mut e164_blocks = Vec::with_capacity(e164s.len() * E164_BLOCK_LEN);
    for e164 in e164s {
        e164_blocks.extend_from_slice(&e164.to_block());
    }
    let mut identity_access_pairs = Vec::with_capacity(pairs.len() * PAIR_LEN);
    for pair in pairs {
        identity_access_pairs.extend_from_slice(pair.identity.as_bytes());
        identity_access_pairs.extend_from_slice(&pair.access_key);
    }

    let payload = ClientRequest {
        e164_blocks,
        identity_access_pairs,
    };
    let mut out = Vec::with_capacity(1 + payload.encoded_len());
    out.push(version);
    out.extend_from_slice(&payload.encode_to_vec());
    out
}

/// Inverse of [`encode_client_request`], used by the in-memory enclave.
pub(crate) fn decode_client_request(
    bytes: &[u8],
) -> DiscoveryResult<(u8, Vec<E164>, Vec<IdentityAccessPair>)> {
    let (&version, payload) = bytes
        .split_first()
        .ok_or_else(|| DiscoveryError::ProtocolViolation("Empty request".into()))?;
    let request = ClientRequest::decode(payload)
        .map_err(|e| DiscoveryError::ProtocolViolation(format!("Malformed request: {}", e)))?;

    if request.e164_blocks.len() % E164_BLOCK_LEN != 0
        || request.identity_access_pairs.len() % PAIR_LEN != 0
    {
        return Err(DiscoveryError::ProtocolViolation(
            "Request blocks not aligned".into(),
        ));
    }

    let e164s = request
        .e164_blocks
        .chunks_exact(E164_BLOCK_LEN)
        .filter_map(|chunk| chunk.try_into().ok().and_then(E164::from_block))
        .collect();
    let pairs = request
        .identity_access_pairs
        .chunks_exact(PAIR_LEN)
        .filter_map(|chunk| {
            let identity = Uuid::from_slice(&chunk[..16]).ok()?;
            let access_key = chunk[16..].try_into().ok()?;
            Some(IdentityAccessPair {
                identity,
                access_key,
            })
        })
        .collect();
    Ok((version, e164s, pairs))
}

/// One decoded response triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Triple {
    /// Number the identities belong to.
    pub e164: E164,
    /// Phone-number identity.
    pub secondary: Option<Uuid>,
    /// Account identity.
    pub primary: Option<Uuid>,
}

fn identity(bytes: &[u8]) -> Option<Uuid> {
    Uuid::from_slice(bytes).ok().filter(|uuid| !uuid.is_nil())
}

/// Decodes a response fragment. Triples with an all-zero number are skipped.
pub(crate) fn decode_triples(bytes: &[u8]) -> DiscoveryResult<Vec<Triple>> {
    if bytes.len() % TRIPLE_LEN != 0 {
        return Err(DiscoveryError::ProtocolViolation(format!(
            "Response fragment of {} bytes is not a multiple of {}",
            bytes.len(),
            TRIPLE_LEN
        )));
    }
    Ok(bytes
        .chunks_exact(TRIPLE_LEN)
        .filter_map(|chunk| {
            let block = chunk[..E164_BLOCK_LEN].try_into().ok()?;
            let e164 = E164::from_block(block)?;
            Some(Triple {
                e164,
                secondary: identity(&chunk[E164_BLOCK_LEN..E164_BLOCK_LEN + 16]),
                primary: identity(&chunk[E164_BLOCK_LEN + 16..]),
            })
        })
        .collect())
}

/// Packs triples for the wire. Absent identities become nil UUIDs.
pub(crate) fn encode_triples(triples: &[Triple]) -> Vec<u8> {
    let mut out = Vec::with_capacity(triples.len() * TRIPLE_LEN);
    for triple in triples {
        out.extend_from_slice(&triple.e164.to_block());
        out.extend_from_slice(triple.secondary.unwrap_or_default().as_bytes());
        out.extend_from_slice(triple.primary.unwrap_or_default().as_bytes());
    }
    out
}

/// Folds triples into a response map.
pub(crate) fn collect_triples(response: &mut DiscoveryResponse, triples: Vec<Triple>) {
    for triple in triples {
        response.insert(
            triple.e164.to_string(),
            DiscoveryResponseEntry {
                primary_identity: triple.primary,
                secondary_identity: triple.secondary,
            },
        );
    }
}
