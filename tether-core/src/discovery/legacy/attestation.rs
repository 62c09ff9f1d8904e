// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! SGX Attestation Checks
//!
//! Every check is fatal. A quote is accepted only when its layout, flags,
//! measurement and report data are exactly as expected, the signed body is
//! fresh and matches the quote, and the signature chains to the pinned
//! anchor.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};
use serde::{Deserialize, Serialize};
use x509_parser::certificate::X509Certificate;
use x509_parser::oid_registry::{
    OID_X509_COMMON_NAME, OID_X509_COUNTRY_NAME, OID_X509_LOCALITY_NAME,
    OID_X509_ORGANIZATION_NAME, OID_X509_STATE_OR_PROVINCE_NAME,
};
use x509_parser::pem::Pem;
use x509_parser::x509::X509Name;

use crate::discovery::crypto::constant_time_eq;
use crate::discovery::error::{DiscoveryError, DiscoveryResult};

const SGX_FLAGS_INITTED: u64 = 0x0000_0000_0000_0001;
const SGX_FLAGS_MODE64BIT: u64 = 0x0000_0000_0000_0004;
const SGX_FLAGS_RESERVED: u64 = 0xFFFF_FFFF_FFFF_FFC8;
const SGX_XFRM_RESERVED: u64 = 0xFFFF_FFFF_FFFF_FFF8;

const MAX_QUOTE_VERSION: u16 = 2;

/// Offset of the signature length field; the signature follows it.
pub(crate) const QUOTE_SIGNATURE_LEN_OFFSET: usize = 432;
/// Smallest well-formed quote (no signature bytes).
pub(crate) const QUOTE_MIN_LEN: usize = QUOTE_SIGNATURE_LEN_OFFSET + 4;
pub(crate) const QUOTE_FLAGS_OFFSET: usize = 96;
pub(crate) const QUOTE_XFRM_OFFSET: usize = 104;
pub(crate) const QUOTE_MRENCLAVE_OFFSET: usize = 112;
pub(crate) const QUOTE_REPORT_DATA_OFFSET: usize = 368;

/// Only body version accepted.
pub const SIGNATURE_BODY_VERSION: u32 = 4;
/// Quote status the service is known to report.
pub const EXPECTED_QUOTE_STATUS: &str = "SW_HARDENING_NEEDED";
/// The one advisory the service is known to carry.
pub const EXPECTED_ADVISORY_ID: &str = "INTEL-SA-00334";
/// Maximum age of a signed attestation body.
pub const MAX_SIGNATURE_AGE_HOURS: i64 = 24;

const LEAF_SUBJECT: [(&str, &str); 5] = [
    ("CN", "Intel SGX Attestation Report Signing"),
    ("O", "Intel Corporation"),
    ("L", "Santa Clara"),
    ("ST", "CA"),
    ("C", "US"),
];

fn invalid(message: impl Into<String>) -> DiscoveryError {
    DiscoveryError::AttestationInvalid(message.into())
}

fn all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

fn read_u64_le(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

/// Validates an SGX quote against the pinned measurement and the server's
/// static key.
pub fn validate_quote(
    quote: &[u8],
    server_static_public: &[u8; 32],
    enclave_id: &[u8],
) -> DiscoveryResult<()> {
    if quote.len() < QUOTE_MIN_LEN {
        return Err(invalid(format!("Quote too short: {} bytes", quote.len())));
    }

    let version = u16::from_le_bytes([quote[0], quote[1]]);
    if version > MAX_QUOTE_VERSION {
        return Err(invalid(format!("Unknown quote version {}", version)));
    }

    // miscselect and reserved1
    if !all_zero(&quote[64..68]) {
        return Err(invalid("Quote miscselect invalid"));
    }
    if !all_zero(&quote[68..96]) {
        return Err(invalid("Quote reserved1 invalid"));
    }

    let flags = read_u64_le(quote, QUOTE_FLAGS_OFFSET);
    if flags & SGX_FLAGS_RESERVED != 0
        || flags & SGX_FLAGS_INITTED == 0
        || flags & SGX_FLAGS_MODE64BIT == 0
    {
        return Err(invalid(format!("Quote flags invalid {:#x}", flags)));
    }

    let xfrm = read_u64_le(quote, QUOTE_XFRM_OFFSET);
    if xfrm & SGX_XFRM_RESERVED != 0 {
        return Err(invalid(format!("Quote xfrm invalid {:#x}", xfrm)));
    }

    let mrenclave = &quote[QUOTE_MRENCLAVE_OFFSET..QUOTE_MRENCLAVE_OFFSET + 32];
    if !constant_time_eq(mrenclave, enclave_id) {
        return Err(invalid("Quote mrenclave invalid"));
    }

    if !all_zero(&quote[144..176]) {
        return Err(invalid("Quote reserved2 invalid"));
    }

    let report_data = &quote[QUOTE_REPORT_DATA_OFFSET..QUOTE_REPORT_DATA_OFFSET + 64];
    if !constant_time_eq(&report_data[..32], server_static_public) || !all_zero(&report_data[32..])
    {
        return Err(invalid("Quote report_data invalid"));
    }

    if !all_zero(&quote[208..304]) {
        return Err(invalid("Quote reserved3 invalid"));
    }
    if !all_zero(&quote[308..368]) {
        return Err(invalid("Quote reserved4 invalid"));
    }

    let offset = QUOTE_SIGNATURE_LEN_OFFSET;
    let signature_len =
        u32::from_le_bytes([quote[offset], quote[offset + 1], quote[offset + 2], quote[offset + 3]]);
    if signature_len as usize != quote.len() - QUOTE_MIN_LEN {
        return Err(invalid(format!("Bad signature length {}", signature_len)));
    }
    Ok(())
}

/// Signed attestation verification report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureBody {
    /// UTC time of signing, RFC 3339 with or without the trailing `Z`.
    pub timestamp: String,
    /// Report version.
    pub version: u32,
    /// Base64 quote body prefix.
    pub isv_enclave_quote_body: String,
    /// Quote status.
    pub isv_enclave_quote_status: String,
    /// Security advisories.
    #[serde(rename = "advisoryIDs")]
    pub advisory_ids: Vec<String>,
}

/// Validates the signed body against the base64 quote at time `now`.
pub fn validate_signature_body(
    body: &SignatureBody,
    encoded_quote: &str,
    now: DateTime<Utc>,
) -> DiscoveryResult<()> {
    if body.version != SIGNATURE_BODY_VERSION {
        return Err(invalid("Attestation signature invalid version"));
    }
    if !encoded_quote.starts_with(&body.isv_enclave_quote_body) {
        return Err(invalid("Attestation signature mismatches quote"));
    }
    if body.isv_enclave_quote_status != EXPECTED_QUOTE_STATUS {
        return Err(invalid(format!(
            "Attestation signature status not {:?}",
            EXPECTED_QUOTE_STATUS
        )));
    }
    if body.advisory_ids.len() != 1 || body.advisory_ids[0] != EXPECTED_ADVISORY_ID {
        return Err(invalid("Attestation advisory ids are incorrect"));
    }

    let signed_at = parse_timestamp(&body.timestamp)?;
    if signed_at < now - ChronoDuration::hours(MAX_SIGNATURE_AGE_HOURS) {
        return Err(invalid("Attestation signature older than 24 hours"));
    }
    Ok(())
}

fn parse_timestamp(timestamp: &str) -> DiscoveryResult<DateTime<Utc>> {
    let utc = if timestamp.ends_with('Z') {
        timestamp.to_string()
    } else {
        format!("{}Z", timestamp)
    };
    DateTime::parse_from_rfc3339(&utc)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|e| invalid(format!("Bad attestation timestamp {:?}: {}", timestamp, e)))
}

/// Checks the RSA signature over a signature body and its certificate chain.
pub trait AttestationSignatureVerifier: Send + Sync {
    /// Verifies `signature` over `signature_body` with the first certificate
    /// of the PEM `certificates` chain.
    fn verify(
        &self,
        signature: &[u8],
        signature_body: &[u8],
        certificates: &str,
    ) -> DiscoveryResult<()>;
}

/// X.509 verifier pinned to one trust anchor.
#[derive(Debug, Clone)]
pub struct X509SignatureVerifier {
    anchor: Vec<u8>,
}

impl X509SignatureVerifier {
    /// Pins the PEM `trust_anchor`.
    pub fn new(trust_anchor: &str) -> DiscoveryResult<Self> {
        let anchor = Pem::iter_from_buffer(trust_anchor.as_bytes())
            .next()
            .ok_or_else(|| invalid("No trust anchor certificate"))?
            .map_err(|e| invalid(format!("Bad trust anchor: {}", e)))?;
        anchor
            .parse_x509()
            .map_err(|e| invalid(format!("Bad trust anchor: {}", e)))?;
        Ok(X509SignatureVerifier {
            anchor: anchor.contents,
        })
    }
}

fn subject_field(name: &X509Name<'_>, field: &str) -> Option<String> {
    let oid = match field {
        "CN" => OID_X509_COMMON_NAME,
        "O" => OID_X509_ORGANIZATION_NAME,
        "L" => OID_X509_LOCALITY_NAME,
        "ST" => OID_X509_STATE_OR_PROVINCE_NAME,
        "C" => OID_X509_COUNTRY_NAME,
        _ => return None,
    };
    name.iter_by_oid(&oid)
        .next()
        .and_then(|value| value.as_str().ok())
        .map(str::to_string)
}

fn check_leaf_subject(leaf: &X509Certificate<'_>) -> DiscoveryResult<()> {
    for (field, expected) in LEAF_SUBJECT {
        if subject_field(leaf.subject(), field).as_deref() != Some(expected) {
            return Err(invalid(format!("Leaf cert {} field had unexpected value", field)));
        }
    }
    Ok(())
}

impl AttestationSignatureVerifier for X509SignatureVerifier {
    fn verify(
        &self,
        signature: &[u8],
        signature_body: &[u8],
        certificates: &str,
    ) -> DiscoveryResult<()> {
        let pems = Pem::iter_from_buffer(certificates.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(format!("Bad certificate PEM: {}", e)))?;
        if pems.len() < 2 {
            return Err(invalid(format!(
                "Expected two or more certificates, got {}",
                pems.len()
            )));
        }
        let chain = pems
            .iter()
            .map(|pem| pem.parse_x509())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(format!("Bad certificate: {}", e)))?;

        let leaf = &chain[0];
        UnparsedPublicKey::new(
            &RSA_PKCS1_2048_8192_SHA256,
            leaf.public_key().subject_public_key.data.as_ref(),
        )
        .verify(signature_body, signature)
        .map_err(|_| invalid("Signature over signature body failed"))?;

        for cert in &chain {
            if !cert.validity().is_valid() {
                return Err(invalid("Certificate outside its validity period"));
            }
        }
        for pair in chain.windows(2) {
            pair[0]
                .verify_signature(Some(pair[1].public_key()))
                .map_err(|_| invalid("Validation of certificate chain failed"))?;
        }

        let (_, anchor) = x509_parser::parse_x509_certificate(&self.anchor)
            .map_err(|e| invalid(format!("Bad trust anchor: {}", e)))?;
        let top = &chain[chain.len() - 1];
        let anchored = top.tbs_certificate.as_ref() == anchor.tbs_certificate.as_ref()
            || top.verify_signature(Some(anchor.public_key())).is_ok();
        if !anchored {
            return Err(invalid("Certificate chain does not reach the trust anchor"));
        }

        check_leaf_subject(leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCLAVE_ID: [u8; 32] = [0xAB; 32];
    const STATIC_KEY: [u8; 32] = [0x11; 32];

    fn valid_quote() -> Vec<u8> {
        let mut quote = vec![0u8; QUOTE_MIN_LEN + 4];
        quote[0] = 1;
        quote[QUOTE_FLAGS_OFFSET] = (SGX_FLAGS_INITTED | SGX_FLAGS_MODE64BIT) as u8;
        quote[QUOTE_XFRM_OFFSET] = 0x03;
        quote[QUOTE_MRENCLAVE_OFFSET..QUOTE_MRENCLAVE_OFFSET + 32].copy_from_slice(&ENCLAVE_ID);
        quote[QUOTE_REPORT_DATA_OFFSET..QUOTE_REPORT_DATA_OFFSET + 32]
            .copy_from_slice(&STATIC_KEY);
        quote[QUOTE_SIGNATURE_LEN_OFFSET..QUOTE_MIN_LEN].copy_from_slice(&4u32.to_le_bytes());
        quote
    }

    fn valid_body(quote_b64: &str, now: DateTime<Utc>) -> SignatureBody {
        SignatureBody {
            timestamp: now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            version: SIGNATURE_BODY_VERSION,
            isv_enclave_quote_body: quote_b64[..quote_b64.len() / 2].to_string(),
            isv_enclave_quote_status: EXPECTED_QUOTE_STATUS.to_string(),
            advisory_ids: vec![EXPECTED_ADVISORY_ID.to_string()],
        }
    }

    // INLINE_TEST_REQUIRED: Exercises crate-private quote layout offsets
    #[test]
    fn test_valid_quote_accepted() {
        validate_quote(&valid_quote(), &STATIC_KEY, &ENCLAVE_ID).unwrap();
    }

    #[test]
    fn test_quote_checks_each_fatal() {
        let cases: [(&str, fn(&mut Vec<u8>)); 14] = [
            ("version", |q| q[0] = 3),
            ("miscselect", |q| q[65] = 1),
            ("reserved1", |q| q[80] = 1),
            ("reserved flag", |q| q[QUOTE_FLAGS_OFFSET] |= 0x40),
            ("not initted", |q| q[QUOTE_FLAGS_OFFSET] &= !0x01),
            ("not 64-bit", |q| q[QUOTE_FLAGS_OFFSET] &= !0x04),
            ("xfrm", |q| q[QUOTE_XFRM_OFFSET] |= 0x08),
            ("mrenclave", |q| q[QUOTE_MRENCLAVE_OFFSET] ^= 0xFF),
            ("reserved2", |q| q[150] = 1),
            ("reserved3", |q| q[250] = 1),
            ("reserved4", |q| q[320] = 1),
            ("report data key", |q| q[QUOTE_REPORT_DATA_OFFSET] ^= 0xFF),
            ("report data tail", |q| q[QUOTE_REPORT_DATA_OFFSET + 40] = 1),
            ("signature length", |q| q.push(0)),
        ];
        for (name, corrupt) in cases {
            let mut quote = valid_quote();
            corrupt(&mut quote);
            assert!(
                matches!(
                    validate_quote(&quote, &STATIC_KEY, &ENCLAVE_ID),
                    Err(DiscoveryError::AttestationInvalid(_))
                ),
                "{} corruption accepted",
                name
            );
        }
    }

    #[test]
    fn test_short_quote_rejected() {
        assert!(validate_quote(&[0u8; 100], &STATIC_KEY, &ENCLAVE_ID).is_err());
    }

    #[test]
    fn test_signature_body_checks() {
        let now = Utc::now();
        let quote = "AQAAAAAAAAAAAAAAAAAAAAAAAAAA";
        validate_signature_body(&valid_body(quote, now), quote, now).unwrap();

        let mut wrong_version = valid_body(quote, now);
        wrong_version.version = 3;
        assert!(validate_signature_body(&wrong_version, quote, now).is_err());

        let mut mismatched = valid_body(quote, now);
        mismatched.isv_enclave_quote_body = "ZZZZ".into();
        assert!(validate_signature_body(&mismatched, quote, now).is_err());

        let mut status = valid_body(quote, now);
        status.isv_enclave_quote_status = "OK".into();
        assert!(validate_signature_body(&status, quote, now).is_err());

        let mut advisories = valid_body(quote, now);
        advisories.advisory_ids.push("INTEL-SA-00999".into());
        assert!(validate_signature_body(&advisories, quote, now).is_err());
    }

    #[test]
    fn test_signature_body_freshness() {
        let now = Utc::now();
        let quote = "AQAAAAAAAAAA";
        let signed = valid_body(quote, now - ChronoDuration::hours(23));
        validate_signature_body(&signed, quote, now).unwrap();

        let stale = valid_body(quote, now - ChronoDuration::hours(25));
        assert!(matches!(
            validate_signature_body(&stale, quote, now),
            Err(DiscoveryError::AttestationInvalid(_))
        ));

        let mut zulu = valid_body(quote, now);
        zulu.timestamp.push('Z');
        validate_signature_body(&zulu, quote, now).unwrap();
    }

    #[test]
    fn test_signature_body_json_names() {
        let json = r#"{
            "timestamp": "2026-10-19T08:00:00.000000",
            "version": 4,
            "isvEnclaveQuoteBody": "AQ",
            "isvEnclaveQuoteStatus": "SW_HARDENING_NEEDED",
            "advisoryIDs": ["INTEL-SA-00334"]
        }"#;
        let body: SignatureBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.advisory_ids, vec!["INTEL-SA-00334".to_string()]);
        assert_eq!(body.isv_enclave_quote_body, "AQ");
    }

    #[test]
    fn test_verifier_rejects_garbage() {
        assert!(X509SignatureVerifier::new("not a certificate").is_err());
    }
}
