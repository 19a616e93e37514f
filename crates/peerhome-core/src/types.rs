//! Core types for Peerhome

pub mod device;

use rand::RngCore;
use serde::{Deserialize, Serialize};

pub use device::{Device, LinkupServer};

/// Content hash of a persisted object.
///
/// Rendered as base58 of a BLAKE3 digest. Hashes compare and sort as
/// strings, which is what deterministic peer-group ids are built from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(String);

impl ObjectHash {
    /// Wrap an already-computed hash string
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Hash raw bytes
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(bs58::encode(blake3::hash(bytes).as_bytes()).into_string())
    }

    /// Hash a domain-separated sequence of fields.
    ///
    /// Each field is length-prefixed so `("ab", "c")` and `("a", "bc")`
    /// never collide.
    pub fn for_fields(domain: &str, fields: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain.as_bytes());
        for field in fields {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Self(bs58::encode(hasher.finalize().as_bytes()).into_string())
    }

    /// Get the hash as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A cryptographic principal, referenced everywhere else by its hash.
///
/// Key management belongs to the identity subsystem; this crate only needs
/// a stable content hash and the optional public info that travels inside
/// invite tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Public key bytes
    pub public_key: [u8; 32],
    /// Optional human-readable info (display name)
    pub info: Option<String>,
}

impl Identity {
    /// Create an identity from an existing public key
    pub fn new(public_key: [u8; 32], info: Option<String>) -> Self {
        Self { public_key, info }
    }

    /// Create an identity with a random key
    pub fn generate(info: Option<&str>) -> Self {
        let mut public_key = [0u8; 32];
        rand::rng().fill_bytes(&mut public_key);
        Self {
            public_key,
            info: info.map(str::to_string),
        }
    }

    /// Stable content hash
    pub fn hash(&self) -> ObjectHash {
        let info = self.info.as_deref().unwrap_or_default();
        ObjectHash::for_fields("peerhome/identity", &[&self.public_key, info.as_bytes()])
    }
}

/// A reachable peer: an endpoint string plus the identity it speaks for.
///
/// The identity is absent only when an endpoint could not be attributed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Endpoint string (see [`crate::endpoint`])
    pub endpoint: String,
    /// Hash of the identity behind the endpoint
    pub identity_hash: Option<ObjectHash>,
}

impl PeerInfo {
    /// Create a peer for a known identity
    pub fn new(endpoint: impl Into<String>, identity_hash: ObjectHash) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity_hash: Some(identity_hash),
        }
    }
}
