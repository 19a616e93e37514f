//! Content-addressed object store
//!
//! The store is an external collaborator: it loads and saves objects by
//! content hash. Two implementations ship with the crate:
//! - [`MemoryStore`] for tests and in-process demos
//! - [`RedbStore`] for ACID persistence on disk

mod persistent;

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::account::AccountRecord;
use crate::error::HomeResult;
use crate::types::{Device, Identity, LinkupServer, ObjectHash};

pub use persistent::RedbStore;

/// An object the store knows how to persist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredObject {
    Identity(Identity),
    Device(Device),
    LinkupServer(LinkupServer),
    Account(AccountRecord),
}

impl StoredObject {
    /// Content hash the object is stored under
    pub fn hash(&self) -> ObjectHash {
        match self {
            StoredObject::Identity(identity) => identity.hash(),
            StoredObject::Device(device) => device.hash(),
            StoredObject::LinkupServer(server) => server.hash(),
            StoredObject::Account(record) => record.hash(),
        }
    }
}

impl From<Identity> for StoredObject {
    fn from(identity: Identity) -> Self {
        StoredObject::Identity(identity)
    }
}

impl From<Device> for StoredObject {
    fn from(device: Device) -> Self {
        StoredObject::Device(device)
    }
}

impl From<LinkupServer> for StoredObject {
    fn from(server: LinkupServer) -> Self {
        StoredObject::LinkupServer(server)
    }
}

impl From<AccountRecord> for StoredObject {
    fn from(record: AccountRecord) -> Self {
        StoredObject::Account(record)
    }
}

/// Load/save by content hash
#[async_trait]
pub trait Store: Send + Sync {
    /// Load an object, or `None` if the store has never seen it
    async fn load(&self, hash: &ObjectHash) -> HomeResult<Option<StoredObject>>;

    /// Persist an object and return its hash. Saving twice is harmless.
    async fn save(&self, object: &StoredObject) -> HomeResult<ObjectHash>;
}

/// Load an identity, treating an object of another kind as absent.
pub async fn load_identity(store: &dyn Store, hash: &ObjectHash) -> HomeResult<Option<Identity>> {
    match store.load(hash).await? {
        Some(StoredObject::Identity(identity)) => Ok(Some(identity)),
        Some(other) => {
            debug!(%hash, ?other, "expected an identity");
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Load a device, treating an object of another kind as absent.
pub async fn load_device(store: &dyn Store, hash: &ObjectHash) -> HomeResult<Option<Device>> {
    match store.load(hash).await? {
        Some(StoredObject::Device(device)) => Ok(Some(device)),
        Some(other) => {
            debug!(%hash, ?other, "expected a device");
            Ok(None)
        }
        None => Ok(None),
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectHash, StoredObject>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self, hash: &ObjectHash) -> HomeResult<Option<StoredObject>> {
        Ok(self.objects.read().get(hash).cloned())
    }

    async fn save(&self, object: &StoredObject) -> HomeResult<ObjectHash> {
        let hash = object.hash();
        self.objects.write().insert(hash.clone(), object.clone());
        Ok(hash)
    }
}
