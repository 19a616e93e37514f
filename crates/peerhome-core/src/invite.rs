//! Invite tokens for bootstrapping trust between two identities
//!
//! An invite token carries everything a stranger needs to reach the
//! inviter and prove they were handed the token:
//! - The random secret (source of all key material)
//! - The sender's identity hash and public info
//! - The sender's device hashes and linkup locator
//!
//! The token id is derived from the secret alone, so re-deriving a token
//! from the same secret always yields the same id and the same invite
//! peer group.
//!
//! Tokens are encoded as `home-invite:{base58}` strings for sharing.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, InviteKey};
use crate::endpoint;
use crate::error::{HomeError, HomeResult};
use crate::types::{Device, Identity, ObjectHash, PeerInfo};

/// Prefix for encoded invite strings
const INVITE_PREFIX: &str = "home-invite:";

/// Current token format version
const PROTOCOL_VERSION: u8 = 1;

/// A secret-bearing bootstrap credential.
///
/// # Example
///
/// ```ignore
/// use peerhome_core::invite::InviteToken;
///
/// let token = InviteToken::new(&me, my_devices.iter(), "https://linkup.example.com", 128);
/// let shared = token.encode()?;
/// // -> "home-invite:5Hx2..."
///
/// let received = InviteToken::decode(&shared)?;
/// assert_eq!(received.hash(), token.hash());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteToken {
    /// Token format version
    pub version: u8,
    /// Hex-encoded random secret
    pub secret: String,
    /// Hash of the inviting identity
    pub sender_identity_hash: ObjectHash,
    /// Public info of the inviting identity
    pub sender_info: Option<String>,
    /// Hashes of the inviter's devices at the time the token was minted
    pub sender_devices: BTreeSet<ObjectHash>,
    /// Linkup locator the inviter's devices listen on
    pub sender_linkup: String,
}

impl InviteToken {
    /// Mint a token with a fresh secret of `secret_bits` bits.
    pub fn new<'a>(
        sender: &Identity,
        devices: impl IntoIterator<Item = &'a Device>,
        linkup: impl Into<String>,
        secret_bits: usize,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            secret: crypto::random_hex(secret_bits),
            sender_identity_hash: sender.hash(),
            sender_info: sender.info.clone(),
            sender_devices: devices.into_iter().map(Device::hash).collect(),
            sender_linkup: linkup.into(),
        }
    }

    /// Rebuild a token from a known secret.
    ///
    /// # Errors
    ///
    /// Returns `HomeError::InvalidInvite` if the secret is empty or not hex.
    pub fn from_secret(
        secret: impl Into<String>,
        sender_identity_hash: ObjectHash,
        sender_devices: impl IntoIterator<Item = ObjectHash>,
        linkup: impl Into<String>,
    ) -> HomeResult<Self> {
        let token = Self {
            version: PROTOCOL_VERSION,
            secret: secret.into(),
            sender_identity_hash,
            sender_info: None,
            sender_devices: sender_devices.into_iter().collect(),
            sender_linkup: linkup.into(),
        };
        token.validate()?;
        Ok(token)
    }

    /// Attach sender info (builder pattern).
    pub fn with_sender_info(mut self, info: impl Into<String>) -> Self {
        self.sender_info = Some(info.into());
        self
    }

    /// Token id, derived deterministically from the secret.
    pub fn hash(&self) -> ObjectHash {
        ObjectHash::for_bytes(self.secret.as_bytes())
    }

    /// ChaCha20 key for the receiver endpoint codec.
    pub fn key(&self) -> HomeResult<InviteKey> {
        InviteKey::derive(&self.secret)
    }

    /// Id of the replicated slot holding the sender's identity
    pub fn sender_slot_id(&self) -> String {
        format!("{}/sender", self.hash())
    }

    /// Id of the replicated slot holding the receiver's reply
    pub fn reply_slot_id(&self) -> String {
        format!("{}/reply", self.hash())
    }

    fn validate(&self) -> HomeResult<()> {
        if self.secret.is_empty() || !self.secret.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HomeError::InvalidInvite(
                "secret must be a non-empty hex string".to_string(),
            ));
        }
        if self.sender_linkup.is_empty() {
            return Err(HomeError::InvalidInvite("missing sender linkup".to_string()));
        }
        Ok(())
    }

    /// Encode the token as a `home-invite:{base58}` string.
    pub fn encode(&self) -> HomeResult<String> {
        let bytes = postcard::to_allocvec(self)
            .map_err(|e| HomeError::Serialization(format!("Failed to encode invite: {}", e)))?;
        Ok(format!("{}{}", INVITE_PREFIX, bs58::encode(&bytes).into_string()))
    }

    /// Decode a token from a `home-invite:{base58}` string.
    ///
    /// # Errors
    ///
    /// Returns `HomeError::InvalidInvite` if:
    /// - The string doesn't start with `home-invite:`
    /// - The base58 encoding is invalid
    /// - The binary data is malformed or carries an unusable secret
    pub fn decode(s: &str) -> HomeResult<Self> {
        let data = s.trim().strip_prefix(INVITE_PREFIX).ok_or_else(|| {
            HomeError::InvalidInvite(format!(
                "Invalid prefix: expected '{}', got '{}'",
                INVITE_PREFIX,
                s.chars().take(15).collect::<String>()
            ))
        })?;

        let bytes = bs58::decode(data)
            .into_vec()
            .map_err(|e| HomeError::InvalidInvite(format!("Invalid base58: {}", e)))?;

        let token: InviteToken = postcard::from_bytes(&bytes)
            .map_err(|e| HomeError::InvalidInvite(format!("Invalid token data: {}", e)))?;
        token.validate()?;

        Ok(token)
    }

    /// The inviter's devices as peers.
    pub fn sender_peers(&self) -> Vec<PeerInfo> {
        self.sender_devices
            .iter()
            .map(|device| {
                PeerInfo::new(
                    endpoint::device_endpoint(&self.sender_linkup, device),
                    self.sender_identity_hash.clone(),
                )
            })
            .collect()
    }

    /// Resolve a device endpoint, accepting only devices listed in the token.
    pub fn parse_sender_endpoint(&self, ep: &str) -> Option<PeerInfo> {
        let device = endpoint::device_hash_from_endpoint(ep).ok()?;
        self.sender_devices.contains(&device).then(|| {
            PeerInfo::new(
                endpoint::device_endpoint(&self.sender_linkup, &device),
                self.sender_identity_hash.clone(),
            )
        })
    }

    /// Encrypted endpoint for the respondent, on the inviter's linkup.
    pub fn receiver_peer(&self, receiver: &ObjectHash) -> HomeResult<PeerInfo> {
        let ep = endpoint::receiver_endpoint(&self.sender_linkup, receiver, &self.key()?)?;
        Ok(PeerInfo::new(ep, receiver.clone()))
    }

    /// Plain `invite-reply` endpoint for the respondent.
    pub fn reply_peer(&self, receiver: &ObjectHash) -> HomeResult<PeerInfo> {
        let ep = endpoint::reply_endpoint(&self.sender_linkup, receiver, &self.secret)?;
        Ok(PeerInfo::new(ep, receiver.clone()))
    }

    /// Resolve either kind of respondent endpoint.
    ///
    /// Returns `None` unless the endpoint authenticates under this token's
    /// secret.
    pub fn parse_receiver_endpoint(&self, ep: &str) -> Option<PeerInfo> {
        let identity = match self.key() {
            Ok(key) => endpoint::identity_from_receiver_endpoint(ep, &key),
            Err(_) => None,
        }
        .or_else(|| endpoint::identity_from_reply_endpoint(ep, &self.secret))?;

        Some(PeerInfo::new(ep, identity))
    }
}

/// An outstanding invite, as stored in the sender's sent-invites set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    /// The token handed to the recipient
    pub token: InviteToken,
    /// Free-form note about who the invite is for
    pub intended_recipient: String,
    /// Unix timestamp (milliseconds) of creation
    pub timestamp: i64,
}

impl Invite {
    /// Wrap a token, stamping the current time
    pub fn new(token: InviteToken, intended_recipient: impl Into<String>) -> Self {
        Self {
            token,
            intended_recipient: intended_recipient.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Invites are keyed by their token
    pub fn hash(&self) -> ObjectHash {
        self.token.hash()
    }
}

/// The respondent's answer to an invite.
///
/// `hmac` is HMAC-SHA-256 of the receiver's identity hash under the invite
/// secret. Only a holder of the token can produce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteReply {
    /// The accepting identity
    pub receiver_identity: Identity,
    /// Hex HMAC proving possession of the secret
    pub hmac: String,
}

impl InviteReply {
    /// Build a reply for `receiver` to `token`
    pub fn new(receiver: Identity, token: &InviteToken) -> HomeResult<Self> {
        let hmac = crypto::hmac_sha256_hex(
            receiver.hash().as_str().as_bytes(),
            token.secret.as_bytes(),
        )?;
        Ok(Self {
            receiver_identity: receiver,
            hmac,
        })
    }

    /// Check the reply against the token the inviter holds
    pub fn verify(&self, token: &InviteToken) -> bool {
        crypto::verify_hmac_sha256_hex(
            self.receiver_identity.hash().as_str().as_bytes(),
            token.secret.as_bytes(),
            &self.hmac,
        )
    }

    /// Content hash
    pub fn hash(&self) -> ObjectHash {
        ObjectHash::for_fields(
            "peerhome/invite-reply",
            &[
                self.receiver_identity.hash().as_str().as_bytes(),
                self.hmac.as_bytes(),
            ],
        )
    }
}
