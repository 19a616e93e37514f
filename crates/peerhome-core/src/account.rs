//! Per-identity device and linkup-server records
//!
//! `AccountDevices` is "all the ways to reach this identity": the devices
//! it has installed and the linkup servers those devices listen on. Every
//! member must be authored by the owning identity.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HomeConfig;
use crate::endpoint;
use crate::error::{HomeError, HomeResult};
use crate::group::{ObjectRef, SyncTarget};
use crate::peers::{MappedCollectionSource, PeerSource};
use crate::replica::{Replica, ReplicatedSet, WatchedCollection};
use crate::storage::{Store, StoredObject};
use crate::types::{Device, LinkupServer, ObjectHash, PeerInfo};

/// Persisted copy of an account's sets, linked to its owner.
///
/// Stored under the account id rather than a content hash, so saving a
/// newer record replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub owner: ObjectHash,
    pub devices: Vec<Device>,
    pub linkup_servers: Vec<LinkupServer>,
}

impl AccountRecord {
    /// Store key of `owner`'s record
    pub fn hash_for(owner: &ObjectHash) -> ObjectHash {
        ObjectHash::from(AccountDevices::id_for(owner).as_str())
    }

    pub fn hash(&self) -> ObjectHash {
        Self::hash_for(&self.owner)
    }
}

/// Device and linkup-server sets of one identity
#[derive(Clone, Debug)]
pub struct AccountDevices {
    owner: ObjectHash,
    default_linkup: String,
    devices: ReplicatedSet<Device>,
    linkup_servers: ReplicatedSet<LinkupServer>,
}

impl AccountDevices {
    /// Deterministic id of an identity's account record
    pub fn id_for(owner: &ObjectHash) -> String {
        format!("account-devices-for-{}", owner)
    }

    /// Open fresh views over `owner`'s account sets.
    pub fn open(replica: &Replica, owner: ObjectHash, config: &HomeConfig) -> HomeResult<Self> {
        let id = Self::id_for(&owner);
        Ok(Self {
            devices: replica.set(&format!("{}/devices", id))?,
            linkup_servers: replica.set(&format!("{}/linkup-servers", id))?,
            default_linkup: config.default_linkup_server.clone(),
            owner,
        })
    }

    pub fn id(&self) -> String {
        Self::id_for(&self.owner)
    }

    pub fn owner(&self) -> &ObjectHash {
        &self.owner
    }

    pub fn devices(&self) -> &ReplicatedSet<Device> {
        &self.devices
    }

    pub fn linkup_servers(&self) -> &ReplicatedSet<LinkupServer> {
        &self.linkup_servers
    }

    /// Record a device of this account.
    ///
    /// # Errors
    ///
    /// Returns `HomeError::AuthorMismatch` if the device belongs to another
    /// identity.
    pub fn add_device(&self, device: Device) -> HomeResult<bool> {
        if device.owner != self.owner {
            return Err(HomeError::AuthorMismatch(format!(
                "device {} is owned by {}, not {}",
                device.hash(),
                device.owner,
                self.owner
            )));
        }
        Ok(self.devices.add(device))
    }

    /// Record a linkup server declared by `author`.
    pub fn add_linkup_server(&self, author: &ObjectHash, server: LinkupServer) -> HomeResult<bool> {
        if author != &self.owner {
            return Err(HomeError::AuthorMismatch(format!(
                "linkup server {} declared by {}, not {}",
                server.url, author, self.owner
            )));
        }
        Ok(self.linkup_servers.add(server))
    }

    /// Snapshot both sets as a record
    pub fn record(&self) -> AccountRecord {
        AccountRecord {
            owner: self.owner.clone(),
            devices: self.devices.values(),
            linkup_servers: self.linkup_servers.values(),
        }
    }

    /// Merge a record into the sets, applying the usual author checks.
    pub fn restore(&self, record: AccountRecord) -> HomeResult<()> {
        for device in record.devices {
            self.add_device(device)?;
        }
        for server in record.linkup_servers {
            self.add_linkup_server(&record.owner, server)?;
        }
        Ok(())
    }

    /// Persist the current record.
    pub async fn save_to(&self, store: &dyn Store) -> HomeResult<ObjectHash> {
        store.save(&self.record().into()).await
    }

    /// Merge the persisted record, if there is one.
    ///
    /// Returns `false` when the store holds no record for this owner.
    pub async fn load_from(&self, store: &dyn Store) -> HomeResult<bool> {
        let hash = AccountRecord::hash_for(&self.owner);
        match store.load(&hash).await? {
            Some(StoredObject::Account(record)) => {
                self.restore(record)?;
                Ok(true)
            }
            Some(other) => {
                debug!(%hash, ?other, "expected an account record");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Locator devices of this account listen on.
    ///
    /// The lowest-sorted declared linkup URL, else the configured default.
    pub fn linkup_locator(&self) -> String {
        locator_for(&self.linkup_servers, &self.default_linkup)
    }

    /// A device of this account as a dialable peer
    pub fn peer_for_device(&self, device: &Device) -> PeerInfo {
        device.as_peer(&self.linkup_locator())
    }

    /// Peers for every device of the account.
    ///
    /// The source reads the sets on each call, so devices and linkup
    /// servers added later are picked up.
    pub fn peer_source(&self) -> Arc<dyn PeerSource> {
        let linkup_servers = self.linkup_servers.clone();
        let default_linkup = self.default_linkup.clone();

        Arc::new(MappedCollectionSource::new(
            vec![self.devices.clone()],
            move |device: &Device| device.as_peer(&locator_for(&linkup_servers, &default_linkup)),
            |ep| endpoint::device_hash_from_endpoint(ep).ok(),
        ))
    }

    /// Start watching both sets.
    pub async fn load_and_watch_for_changes(&self) {
        self.devices.load_and_watch_for_changes().await;
        self.linkup_servers.load_and_watch_for_changes().await;
        debug!(owner = %self.owner, devices = self.devices.len(), "account devices loaded");
    }

    /// The collections feeding [`peer_source`](Self::peer_source)
    pub fn watched(&self) -> Vec<Arc<dyn WatchedCollection>> {
        vec![
            Arc::new(self.devices.clone()) as Arc<dyn WatchedCollection>,
            Arc::new(self.linkup_servers.clone()),
        ]
    }
}

fn locator_for(linkup_servers: &ReplicatedSet<LinkupServer>, default: &str) -> String {
    linkup_servers
        .values()
        .into_iter()
        .min()
        .map(|server| server.url)
        .unwrap_or_else(|| default.to_string())
}

impl SyncTarget for AccountDevices {
    fn target_id(&self) -> String {
        self.id()
    }

    fn root_objects(&self) -> Vec<ObjectRef> {
        vec![self.devices.object_ref(), self.linkup_servers.object_ref()]
    }
}
