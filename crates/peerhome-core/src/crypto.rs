//! Invite handshake cryptography
//!
//! Everything here is keyed by the invite secret alone; no asymmetric keys
//! are involved. The secret is a hex string, and the ChaCha20 key is that
//! string repeated until it covers exactly [`KEY_HEX_LEN`] nibbles. Because
//! there is no KDF step, holders of the same secret derive the same key
//! byte-for-byte.
//!
//! # Primitives
//!
//! - Identity hiding: ChaCha20 keystream over the UTF-8 identity hash,
//!   96-bit random nonce, hex encoded.
//! - Authentication: HMAC-SHA-256, hex encoded, verified in constant time.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{HomeError, HomeResult};
use crate::types::ObjectHash;

type HmacSha256 = Hmac<Sha256>;

/// Symmetric key size for ChaCha20 (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Hex nibbles needed to fill a ChaCha20 key
pub const KEY_HEX_LEN: usize = KEY_SIZE * 2;

/// Nonce size for ChaCha20 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Repeat `secret` until it is exactly `len` characters long.
///
/// # Example
///
/// ```
/// use peerhome_core::crypto::stretch_secret;
///
/// assert_eq!(stretch_secret("ab", 8).unwrap(), "abababab");
/// assert_eq!(stretch_secret("abc", 4).unwrap(), "abca");
/// ```
pub fn stretch_secret(secret: &str, len: usize) -> HomeResult<String> {
    if secret.is_empty() {
        return Err(HomeError::Crypto("cannot stretch an empty secret".to_string()));
    }
    Ok(secret.chars().cycle().take(len).collect())
}

/// Generate a random lowercase hex string carrying `bits` bits of entropy.
///
/// `bits` is rounded up to a whole nibble.
pub fn random_hex(bits: usize) -> String {
    let nibbles = bits.div_ceil(4);
    let mut bytes = vec![0u8; nibbles.div_ceil(2)];
    rand::rng().fill_bytes(&mut bytes);
    let mut s = hex::encode(bytes);
    s.truncate(nibbles);
    s
}

/// HMAC-SHA-256 of `message` under `key`, hex encoded.
pub fn hmac_sha256_hex(message: &[u8], key: &[u8]) -> HomeResult<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| HomeError::Crypto(format!("HMAC key rejected: {}", e)))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex HMAC-SHA-256 tag.
///
/// Any decoding problem counts as a mismatch.
pub fn verify_hmac_sha256_hex(message: &[u8], key: &[u8], tag_hex: &str) -> bool {
    let Ok(tag) = hex::decode(tag_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&tag).is_ok()
}

/// ChaCha20 key derived from an invite secret.
#[derive(Clone, PartialEq, Eq)]
pub struct InviteKey {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for InviteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InviteKey(..)")
    }
}

impl InviteKey {
    /// Derive the key by stretching the hex secret to [`KEY_HEX_LEN`] nibbles.
    ///
    /// Fails if the secret is empty or not hex.
    pub fn derive(secret: &str) -> HomeResult<Self> {
        let stretched = stretch_secret(secret, KEY_HEX_LEN)?;
        let bytes = hex::decode(&stretched)
            .map_err(|e| HomeError::Crypto(format!("invite secret is not hex: {}", e)))?;

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt an identity hash under this key and `nonce`, hex encoded.
    pub fn encrypt_identity(&self, identity: &ObjectHash, nonce: &[u8; NONCE_SIZE]) -> String {
        let mut buf = identity.as_str().as_bytes().to_vec();
        self.apply_keystream(nonce, &mut buf);
        hex::encode(buf)
    }

    /// Decrypt a hex ciphertext produced by [`encrypt_identity`](Self::encrypt_identity).
    pub fn decrypt_identity(&self, ciphertext_hex: &str, nonce_hex: &str) -> HomeResult<ObjectHash> {
        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|e| HomeError::Crypto(format!("nonce is not hex: {}", e)))?;
        let nonce: [u8; NONCE_SIZE] = nonce_bytes.try_into().map_err(|v: Vec<u8>| {
            HomeError::Crypto(format!("nonce must be {} bytes, got {}", NONCE_SIZE, v.len()))
        })?;

        let mut buf = hex::decode(ciphertext_hex)
            .map_err(|e| HomeError::Crypto(format!("ciphertext is not hex: {}", e)))?;
        self.apply_keystream(&nonce, &mut buf);

        let plain = String::from_utf8(buf)
            .map_err(|_| HomeError::Crypto("decrypted identity is not UTF-8".to_string()))?;
        Ok(ObjectHash::new(plain))
    }

    /// HMAC-SHA-256 of `message` under this key, hex encoded.
    pub fn hmac_hex(&self, message: &[u8]) -> HomeResult<String> {
        hmac_sha256_hex(message, &self.key)
    }

    /// Constant-time verification of a tag produced by [`hmac_hex`](Self::hmac_hex).
    pub fn verify_hmac_hex(&self, message: &[u8], tag_hex: &str) -> bool {
        verify_hmac_sha256_hex(message, &self.key, tag_hex)
    }

    fn apply_keystream(&self, nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
        let mut cipher = ChaCha20::new(Key::from_slice(&self.key), Nonce::from_slice(nonce));
        cipher.apply_keystream(buf);
    }
}
