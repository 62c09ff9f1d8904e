// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Discovery Cryptography
//!
//! HKDF-SHA256 key derivation and AES-256-GCM sealing shared by both enclave
//! variants. Everything goes through `ring`; X25519 agreement uses
//! `x25519-dalek` because one client secret is agreed against several server
//! keys.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest::{digest, SHA256};
use ring::hkdf::{KeyType, Salt, HKDF_SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{DiscoveryError, DiscoveryResult};

/// AES-256-GCM key size.
pub(crate) const KEY_LEN: usize = 32;

/// AES-256-GCM nonce size (96 bits).
pub(crate) const NONCE_LEN: usize = 12;

/// AES-256-GCM tag size.
pub(crate) const TAG_LEN: usize = 16;

const SESSION_INFO: &[u8] = b"tether-enclave-discovery-v1";

/// Output length for HKDF expansion.
struct OkmLen(usize);

impl KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// 256-bit symmetric key, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct SecretKey([u8; KEY_LEN]);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

impl SecretKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        SecretKey(bytes)
    }

    pub(crate) fn generate() -> DiscoveryResult<Self> {
        Ok(SecretKey(random_bytes()?))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Fills an array from the system RNG.
pub(crate) fn random_bytes<const N: usize>() -> DiscoveryResult<[u8; N]> {
    let mut bytes = [0u8; N];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| DiscoveryError::Crypto("System RNG failed".into()))?;
    Ok(bytes)
}

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(digest(&SHA256, data).as_ref());
    out
}

/// Compares without short-circuiting on the first differing byte.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Derives two keys from `secret` with HKDF-SHA256.
pub(crate) fn derive_key_pair(
    secret: &[u8],
    salt: &[u8],
    info: &[u8],
) -> DiscoveryResult<(SecretKey, SecretKey)> {
    let prk = Salt::new(HKDF_SHA256, salt).extract(secret);
    let info = [info];
    let okm = prk
        .expand(&info, OkmLen(2 * KEY_LEN))
        .map_err(|_| DiscoveryError::Crypto("HKDF expand failed".into()))?;

    let mut material = [0u8; 2 * KEY_LEN];
    okm.fill(&mut material)
        .map_err(|_| DiscoveryError::Crypto("HKDF fill failed".into()))?;

    let mut first = [0u8; KEY_LEN];
    let mut second = [0u8; KEY_LEN];
    first.copy_from_slice(&material[..KEY_LEN]);
    second.copy_from_slice(&material[KEY_LEN..]);
    material.zeroize();
    Ok((SecretKey(first), SecretKey(second)))
}

fn aead_key(key: &SecretKey) -> DiscoveryResult<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key.as_bytes())
        .map_err(|_| DiscoveryError::Crypto("Invalid key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypts `plaintext`. Output: `ciphertext || tag`.
pub(crate) fn seal(
    key: &SecretKey,
    nonce: [u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> DiscoveryResult<Vec<u8>> {
    let mut in_out = plaintext.to_vec();
    aead_key(key)?
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| DiscoveryError::Crypto("Encryption failed".into()))?;
    Ok(in_out)
}

/// Decrypts `ciphertext || tag`.
pub(crate) fn open(
    key: &SecretKey,
    nonce: [u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> DiscoveryResult<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(DiscoveryError::Crypto("Ciphertext too short".into()));
    }
    let mut in_out = ciphertext.to_vec();
    let plaintext = aead_key(key)?
        .open_in_place(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(aad),
            &mut in_out,
        )
        .map_err(|_| DiscoveryError::Crypto("Decryption failed".into()))?;
    Ok(plaintext.to_vec())
}

/// Which end of a session we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Counter-nonce AES-GCM session between the client and the enclave.
///
/// Both directions start at nonce 0 with their own key. A nonce is never
/// reused: the counter refuses to wrap.
pub(crate) struct SessionCipher {
    send_key: SecretKey,
    receive_key: SecretKey,
    send_counter: u64,
    receive_counter: u64,
}

impl SessionCipher {
    /// Derives the session keys. Salt is the client public key followed by
    /// the server public key.
    pub(crate) fn derive(
        role: Role,
        shared_secret: &[u8],
        client_public: &[u8; 32],
        server_public: &[u8; 32],
    ) -> DiscoveryResult<Self> {
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(client_public);
        salt[32..].copy_from_slice(server_public);
        let (client_to_server, server_to_client) =
            derive_key_pair(shared_secret, &salt, SESSION_INFO)?;

        let (send_key, receive_key) = match role {
            Role::Client => (client_to_server, server_to_client),
            Role::Server => (server_to_client, client_to_server),
        };
        Ok(SessionCipher {
            send_key,
            receive_key,
            send_counter: 0,
            receive_counter: 0,
        })
    }

    fn nonce(counter: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[NONCE_LEN - 8..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    fn advance(counter: &mut u64) -> DiscoveryResult<[u8; NONCE_LEN]> {
        let nonce = Self::nonce(*counter);
        *counter = counter
            .checked_add(1)
            .ok_or_else(|| DiscoveryError::Crypto("Nonce counter exhausted".into()))?;
        Ok(nonce)
    }

    pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> DiscoveryResult<Vec<u8>> {
        let nonce = Self::advance(&mut self.send_counter)?;
        seal(&self.send_key, nonce, &[], plaintext)
    }

    pub(crate) fn decrypt(&mut self, ciphertext: &[u8]) -> DiscoveryResult<Vec<u8>> {
        let nonce = Self::advance(&mut self.receive_counter)?;
        open(&self.receive_key, nonce, &[], ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_with_aad() {
        let key = SecretKey::generate().unwrap();
        let nonce = random_bytes().unwrap();
        let sealed = seal(&key, nonce, b"request-id", b"query key").unwrap();
        assert_eq!(sealed.len(), b"query key".len() + TAG_LEN);

        assert_eq!(open(&key, nonce, b"request-id", &sealed).unwrap(), b"query key");
        assert!(open(&key, nonce, b"other-id", &sealed).is_err());
    }

    #[test]
    fn test_session_directions_pair_up() {
        let secret = [42u8; 32];
        let client_public = [1u8; 32];
        let server_public = [2u8; 32];
        let mut client =
            SessionCipher::derive(Role::Client, &secret, &client_public, &server_public).unwrap();
        let mut server =
            SessionCipher::derive(Role::Server, &secret, &client_public, &server_public).unwrap();

        let first = client.encrypt(b"one").unwrap();
        let second = client.encrypt(b"one").unwrap();
        assert_ne!(first, second, "nonces must advance");

        assert_eq!(server.decrypt(&first).unwrap(), b"one");
        assert_eq!(server.decrypt(&second).unwrap(), b"one");

        let reply = server.encrypt(b"two").unwrap();
        assert_eq!(client.decrypt(&reply).unwrap(), b"two");
    }

    #[test]
    fn test_out_of_order_fragment_fails() {
        let secret = [5u8; 32];
        let mut client = SessionCipher::derive(Role::Client, &secret, &[1; 32], &[2; 32]).unwrap();
        let mut server = SessionCipher::derive(Role::Server, &secret, &[1; 32], &[2; 32]).unwrap();

        let _skipped = server.encrypt(b"first").unwrap();
        let second = server.encrypt(b"second").unwrap();
        assert!(client.decrypt(&second).is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
