//! Devices and linkup servers
//!
//! A device is one installation of an identity. Its content hash, together
//! with a linkup locator, is what other peers dial.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{ObjectHash, PeerInfo};
use crate::endpoint;
use crate::error::{HomeError, HomeResult};

/// One client instance of an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Random id assigned at installation time
    pub id: String,
    /// Hash of the owning identity (the device's author)
    pub owner: ObjectHash,
}

impl Device {
    /// Create a device with a random id
    pub fn new(owner: ObjectHash) -> Self {
        let mut id = [0u8; 16];
        rand::rng().fill_bytes(&mut id);
        Self {
            id: hex::encode(id),
            owner,
        }
    }

    /// Create a device with a known id
    pub fn with_id(id: impl Into<String>, owner: ObjectHash) -> Self {
        Self {
            id: id.into(),
            owner,
        }
    }

    /// Stable content hash
    pub fn hash(&self) -> ObjectHash {
        ObjectHash::for_fields(
            "peerhome/device",
            &[self.id.as_bytes(), self.owner.as_str().as_bytes()],
        )
    }

    /// This device as a peer reachable through `linkup`
    pub fn as_peer(&self, linkup: &str) -> PeerInfo {
        PeerInfo::new(
            endpoint::device_endpoint(linkup, &self.hash()),
            self.owner.clone(),
        )
    }
}

/// A signaling/relay endpoint declared by an account
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkupServer {
    /// Absolute http(s) URL
    pub url: String,
}

impl LinkupServer {
    /// Create a linkup server, rejecting anything but absolute http(s) URLs
    pub fn new(url: impl Into<String>) -> HomeResult<Self> {
        let url = url.into();
        let parsed = url::Url::parse(&url)
            .map_err(|e| HomeError::InvalidLinkupServer(format!("{}: {}", url, e)))?;

        if !matches!(parsed.scheme(), "http" | "https") || !parsed.has_host() {
            return Err(HomeError::InvalidLinkupServer(format!(
                "{}: expected an absolute http(s) URL",
                url
            )));
        }

        Ok(Self { url })
    }

    /// Stable content hash
    pub fn hash(&self) -> ObjectHash {
        ObjectHash::for_fields("peerhome/linkup-server", &[self.url.as_bytes()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ids_are_random() {
        let owner = ObjectHash::from("owner");
        let d1 = Device::new(owner.clone());
        let d2 = Device::new(owner);
        assert_ne!(d1.id, d2.id);
        assert_ne!(d1.hash(), d2.hash());
    }

    #[test]
    fn test_device_as_peer() {
        let device = Device::with_id("d1", ObjectHash::from("owner"));
        let peer = device.as_peer("https://linkup.example.com");
        assert_eq!(
            peer.endpoint,
            format!("https://linkup.example.com/device/{}", device.hash())
        );
        assert_eq!(peer.identity_hash, Some(ObjectHash::from("owner")));
    }

    #[test]
    fn test_linkup_server_validation() {
        assert!(LinkupServer::new("https://linkup.example.com").is_ok());
        assert!(LinkupServer::new("http://10.0.0.1:3002/").is_ok());

        for bad in ["wss://linkup.example.com", "linkup.example.com", "", "https://"] {
            let result = LinkupServer::new(bad);
            assert!(
                matches!(result, Err(HomeError::InvalidLinkupServer(_))),
                "accepted {:?}",
                bad
            );
        }
    }
}
