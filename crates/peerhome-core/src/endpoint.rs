//! Endpoint string codecs
//!
//! Peers are addressed by strings that combine a linkup (relay) locator
//! with a fixed marker segment and a payload:
//!
//! ```text
//! <locator>/device/<deviceHash>
//! <locator>/invite-receiver-identity/<encId>/<nonce>/<hmac>
//! <locator>/invite-reply/<receiverIdentityHash>/<hmac>
//! ```
//!
//! The locator is normalized to end with `/` before the marker is appended.
//!
//! The two invite decoders return `None` for anything they do not
//! recognize. A malformed string and one with a bad HMAC produce the same
//! result and the same trace line, so callers cannot tell them apart.

use tracing::trace;

use crate::crypto::{self, InviteKey, NONCE_SIZE};
use crate::error::{HomeError, HomeResult};
use crate::types::ObjectHash;

/// Marker preceding a device hash
pub const DEVICE_SEGMENT: &str = "device";

/// Marker preceding an encrypted invite-receiver identity
pub const RECEIVER_SEGMENT: &str = "invite-receiver-identity";

/// Marker preceding a plain invite-reply identity
pub const REPLY_SEGMENT: &str = "invite-reply";

/// Ensure a locator ends with exactly one trailing separator.
pub fn normalize_locator(locator: &str) -> String {
    if locator.ends_with('/') {
        locator.to_string()
    } else {
        format!("{}/", locator)
    }
}

/// Endpoint for a device reachable through `locator`.
pub fn device_endpoint(locator: &str, device_hash: &ObjectHash) -> String {
    format!(
        "{}{}/{}",
        normalize_locator(locator),
        DEVICE_SEGMENT,
        device_hash
    )
}

/// Extract the device hash from a plain device endpoint.
///
/// # Errors
///
/// Returns `HomeError::MalformedEndpoint` unless splitting on `/device/`
/// yields exactly two parts with a non-empty device hash.
pub fn device_hash_from_endpoint(endpoint: &str) -> HomeResult<ObjectHash> {
    let marker = format!("/{}/", DEVICE_SEGMENT);
    let parts: Vec<&str> = endpoint.split(marker.as_str()).collect();

    match parts.as_slice() {
        [_, device] if !device.is_empty() => Ok(ObjectHash::new(*device)),
        _ => Err(HomeError::MalformedEndpoint(format!(
            "not a device endpoint: {}",
            endpoint
        ))),
    }
}

/// Endpoint hiding `identity` behind the invite key, with a fresh nonce.
pub fn receiver_endpoint(
    locator: &str,
    identity: &ObjectHash,
    key: &InviteKey,
) -> HomeResult<String> {
    receiver_endpoint_with_nonce(locator, identity, key, &InviteKey::generate_nonce())
}

/// Deterministic variant of [`receiver_endpoint`] with a caller-chosen nonce.
pub fn receiver_endpoint_with_nonce(
    locator: &str,
    identity: &ObjectHash,
    key: &InviteKey,
    nonce: &[u8; NONCE_SIZE],
) -> HomeResult<String> {
    let enc_identity = key.encrypt_identity(identity, nonce);
    let hmac = key.hmac_hex(identity.as_str().as_bytes())?;

    Ok(format!(
        "{}{}/{}/{}/{}",
        normalize_locator(locator),
        RECEIVER_SEGMENT,
        enc_identity,
        hex::encode(nonce),
        hmac
    ))
}

/// Recover and authenticate the identity hidden in a receiver endpoint.
///
/// The last four `/`-separated segments must be
/// `invite-receiver-identity`, encrypted identity, nonce and hmac, in that
/// order. Returns `None` for anything that does not decrypt to an identity
/// whose HMAC matches.
pub fn identity_from_receiver_endpoint(endpoint: &str, key: &InviteKey) -> Option<ObjectHash> {
    let parts: Vec<&str> = endpoint.split('/').collect();

    let recognized = match parts.as_slice() {
        [.., marker, enc_identity, nonce, hmac] if *marker == RECEIVER_SEGMENT => key
            .decrypt_identity(enc_identity, nonce)
            .ok()
            .filter(|identity| key.verify_hmac_hex(identity.as_str().as_bytes(), hmac)),
        _ => None,
    };

    if recognized.is_none() {
        trace!(endpoint, "endpoint not recognized as invite receiver");
    }
    recognized
}

/// Endpoint announcing `identity` in the clear, authenticated by the secret.
pub fn reply_endpoint(locator: &str, identity: &ObjectHash, secret: &str) -> HomeResult<String> {
    let hmac = crypto::hmac_sha256_hex(identity.as_str().as_bytes(), secret.as_bytes())?;
    Ok(format!(
        "{}{}/{}/{}",
        normalize_locator(locator),
        REPLY_SEGMENT,
        identity,
        hmac
    ))
}

/// Recover the identity from an invite-reply endpoint if its HMAC checks out.
pub fn identity_from_reply_endpoint(endpoint: &str, secret: &str) -> Option<ObjectHash> {
    let marker = format!("/{}/", REPLY_SEGMENT);
    let halves: Vec<&str> = endpoint.split(marker.as_str()).collect();

    let recognized = match halves.as_slice() {
        [_, rest] => match rest.split('/').collect::<Vec<_>>().as_slice() {
            [identity, hmac]
                if !identity.is_empty()
                    && crypto::verify_hmac_sha256_hex(
                        identity.as_bytes(),
                        secret.as_bytes(),
                        hmac,
                    ) =>
            {
                Some(ObjectHash::new(*identity))
            }
            _ => None,
        },
        _ => None,
    };

    if recognized.is_none() {
        trace!(endpoint, "endpoint not recognized as invite reply");
    }
    recognized
}
