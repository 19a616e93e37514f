//! Runtime configuration shared by every component.
//!
//! A `HomeConfig` is passed explicitly to the device cloud and the contacts
//! orchestrator; there is no process-wide resources object.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HomeError, HomeResult};
use crate::types::LinkupServer;

/// Default prefix for every peer-group id
pub const DEFAULT_GROUP_PREFIX: &str = "hhs-home";

/// Linkup server used when an account has not declared any
pub const DEFAULT_LINKUP_SERVER: &str = "https://mypeer.net";

/// Entropy of freshly minted invite secrets
pub const DEFAULT_SECRET_BITS: usize = 128;

/// Default capacity for event broadcast channels
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configuration for peer-group naming, addressing and invites
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeConfig {
    /// Prefix for deterministic peer-group ids
    pub group_prefix: String,
    /// Fallback relay locator for accounts without linkup servers
    pub default_linkup_server: String,
    /// Bits of entropy in new invite secrets (multiple of 4)
    pub secret_bits: usize,
    /// Capacity of the orchestrator event channel
    pub event_capacity: usize,
}

impl Default for HomeConfig {
    fn default() -> Self {
        Self {
            group_prefix: DEFAULT_GROUP_PREFIX.to_string(),
            default_linkup_server: DEFAULT_LINKUP_SERVER.to_string(),
            secret_bits: DEFAULT_SECRET_BITS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl HomeConfig {
    /// Set the peer-group id prefix (builder pattern).
    pub fn with_group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_prefix = prefix.into();
        self
    }

    /// Set the fallback linkup server (builder pattern).
    pub fn with_default_linkup_server(mut self, url: impl Into<String>) -> Self {
        self.default_linkup_server = url.into();
        self
    }

    /// Set the invite secret size in bits (builder pattern).
    ///
    /// # Errors
    ///
    /// Returns `HomeError::Serialization` unless `bits` is a positive
    /// multiple of 4.
    pub fn with_secret_bits(mut self, bits: usize) -> HomeResult<Self> {
        check_secret_bits(bits)?;
        self.secret_bits = bits;
        Ok(self)
    }

    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> HomeResult<Self> {
        let config: HomeConfig =
            toml::from_str(s).map_err(|e| HomeError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> HomeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> HomeResult<()> {
        check_secret_bits(self.secret_bits)?;
        if self.group_prefix.is_empty() {
            return Err(HomeError::Serialization(
                "group_prefix must not be empty".to_string(),
            ));
        }
        LinkupServer::new(self.default_linkup_server.as_str())?;
        Ok(())
    }
}

fn check_secret_bits(bits: usize) -> HomeResult<()> {
    if bits == 0 || bits % 4 != 0 {
        return Err(HomeError::Serialization(format!(
            "secret_bits must be a positive multiple of 4, got {}",
            bits
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HomeConfig::default();
        assert_eq!(config.group_prefix, "hhs-home");
        assert_eq!(config.secret_bits, 128);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = HomeConfig::from_toml_str("group_prefix = \"test\"\n").unwrap();
        assert_eq!(config.group_prefix, "test");
        assert_eq!(config.default_linkup_server, DEFAULT_LINKUP_SERVER);
    }

    #[test]
    fn test_rejects_odd_secret_bits() {
        let result = HomeConfig::from_toml_str("secret_bits = 30\n");
        assert!(matches!(result, Err(HomeError::Serialization(_))));
    }

    #[test]
    fn test_secret_bits_builder_validates() {
        for bits in [0, 6, 30] {
            assert!(matches!(
                HomeConfig::default().with_secret_bits(bits),
                Err(HomeError::Serialization(_))
            ));
        }
        let config = HomeConfig::default().with_secret_bits(64).unwrap();
        assert_eq!(config.secret_bits, 64);
    }

    #[test]
    fn test_default_linkup_is_a_valid_server() {
        assert!(LinkupServer::new(DEFAULT_LINKUP_SERVER).is_ok());
        let result = HomeConfig::from_toml_str("default_linkup_server = \"wss://relay:443\"\n");
        assert!(matches!(result, Err(HomeError::InvalidLinkupServer(_))));
    }
}
