//! The owner's own device group
//!
//! Every device of an identity joins `<prefix>-<owner>-devices`. Peers are
//! the account's devices, reached through the account's linkup locator,
//! and the account record itself is the group's first sync target.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::account::AccountDevices;
use crate::config::HomeConfig;
use crate::error::{HomeError, HomeResult};
use crate::group::{device_group_id, PeerGroup, SyncTarget};
use crate::mesh::Mesh;
use crate::module::{Module, ModuleSyncs};
use crate::replica::Replica;
use crate::storage::{self, Store};
use crate::types::{Device, Identity, ObjectHash};

struct Ready {
    owner: Identity,
    local_device: Device,
    account: AccountDevices,
    group: Arc<PeerGroup>,
}

enum CloudState {
    Uninitialized,
    Ready(Arc<Ready>),
}

/// Device-cloud module for one local device
pub struct DeviceCloud {
    owner_hash: ObjectHash,
    local_device_hash: ObjectHash,
    config: HomeConfig,
    store: Arc<dyn Store>,
    mesh: Arc<dyn Mesh>,
    replica: Arc<Replica>,
    state: RwLock<CloudState>,
    init_lock: Mutex<()>,
    syncs: ModuleSyncs,
}

impl DeviceCloud {
    pub fn new(
        owner_hash: ObjectHash,
        local_device_hash: ObjectHash,
        config: HomeConfig,
        store: Arc<dyn Store>,
        mesh: Arc<dyn Mesh>,
        replica: Arc<Replica>,
    ) -> Self {
        Self {
            owner_hash,
            local_device_hash,
            config,
            store,
            mesh,
            replica,
            state: RwLock::new(CloudState::Uninitialized),
            init_lock: Mutex::new(()),
            syncs: ModuleSyncs::new("device-cloud"),
        }
    }

    /// Load the owner and local device and build the device group.
    ///
    /// The local device is recorded in the account if it is not there yet.
    /// Calling `init` again after success does nothing.
    ///
    /// # Errors
    ///
    /// - `HomeError::MissingDependency` if the owner identity or the local
    ///   device is not in the store
    /// - `HomeError::AuthorMismatch` if the device belongs to someone else
    pub async fn init(&self) -> HomeResult<()> {
        let _guard = self.init_lock.lock().await;
        if matches!(*self.state.read(), CloudState::Ready(_)) {
            return Ok(());
        }

        let owner = storage::load_identity(self.store.as_ref(), &self.owner_hash)
            .await?
            .ok_or_else(|| {
                HomeError::MissingDependency(format!("owner identity {}", self.owner_hash))
            })?;
        let local_device = storage::load_device(self.store.as_ref(), &self.local_device_hash)
            .await?
            .ok_or_else(|| {
                HomeError::MissingDependency(format!("local device {}", self.local_device_hash))
            })?;

        let account = AccountDevices::open(&self.replica, self.owner_hash.clone(), &self.config)?;
        if account.load_from(self.store.as_ref()).await? {
            debug!(owner = %self.owner_hash, "account record restored");
        }
        account.add_device(local_device.clone())?;
        account.load_and_watch_for_changes().await;

        let group = Arc::new(
            PeerGroup::new(
                device_group_id(&self.config.group_prefix, &self.owner_hash),
                account.peer_for_device(&local_device),
                account.peer_source(),
                self.mesh.clone(),
            )
            .with_watched(account.watched()),
        );
        group.add_sync_target(Arc::new(account.clone())).await?;
        self.syncs.add_module_sync(group.clone()).await?;

        info!(owner = %self.owner_hash, group_id = %group.id(), "device cloud ready");
        *self.state.write() = CloudState::Ready(Arc::new(Ready {
            owner,
            local_device,
            account,
            group,
        }));
        Ok(())
    }

    fn ready(&self) -> HomeResult<Arc<Ready>> {
        match &*self.state.read() {
            CloudState::Ready(ready) => Ok(ready.clone()),
            CloudState::Uninitialized => Err(HomeError::Uninitialized(format!(
                "device cloud for {}",
                self.owner_hash
            ))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready().is_ok()
    }

    pub fn owner_hash(&self) -> &ObjectHash {
        &self.owner_hash
    }

    pub fn config(&self) -> &HomeConfig {
        &self.config
    }

    /// Deterministic id of the device group
    pub fn group_id(&self) -> String {
        device_group_id(&self.config.group_prefix, &self.owner_hash)
    }

    pub fn owner(&self) -> HomeResult<Identity> {
        Ok(self.ready()?.owner.clone())
    }

    pub fn local_device(&self) -> HomeResult<Device> {
        Ok(self.ready()?.local_device.clone())
    }

    pub fn account(&self) -> HomeResult<AccountDevices> {
        Ok(self.ready()?.account.clone())
    }

    pub fn peer_group(&self) -> HomeResult<Arc<PeerGroup>> {
        Ok(self.ready()?.group.clone())
    }

    /// Share another object between the owner's devices.
    pub async fn add_sync_target(&self, target: Arc<dyn SyncTarget>) -> HomeResult<bool> {
        self.peer_group()?.add_sync_target(target).await
    }
}

#[async_trait]
impl Module for DeviceCloud {
    async fn start(&self) -> HomeResult<()> {
        self.ready()?;
        self.syncs.start().await
    }

    async fn stop(&self) -> HomeResult<()> {
        self.syncs.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::ObjectRef;
    use crate::mesh::MemoryMesh;
    use crate::storage::MemoryStore;

    struct Fixture {
        mesh: Arc<MemoryMesh>,
        store: Arc<MemoryStore>,
        owner: Identity,
        device: Device,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let owner = Identity::generate(Some("Love"));
        let device = Device::new(owner.hash());
        store.save(&owner.clone().into()).await.unwrap();
        store.save(&device.clone().into()).await.unwrap();
        Fixture {
            mesh: Arc::new(MemoryMesh::new()),
            store,
            owner,
            device,
        }
    }

    fn cloud(f: &Fixture) -> DeviceCloud {
        DeviceCloud::new(
            f.owner.hash(),
            f.device.hash(),
            HomeConfig::default(),
            f.store.clone(),
            f.mesh.clone(),
            Arc::new(Replica::new()),
        )
    }

    #[tokio::test]
    async fn test_use_before_init_is_an_error() {
        let f = fixture().await;
        let cloud = cloud(&f);
        assert!(matches!(cloud.account(), Err(HomeError::Uninitialized(_))));
        assert!(matches!(cloud.start().await, Err(HomeError::Uninitialized(_))));
    }

    #[tokio::test]
    async fn test_missing_owner_is_fatal() {
        let f = fixture().await;
        let cloud = DeviceCloud::new(
            ObjectHash::from("nobody"),
            f.device.hash(),
            HomeConfig::default(),
            f.store.clone(),
            f.mesh.clone(),
            Arc::new(Replica::new()),
        );
        assert!(matches!(
            cloud.init().await,
            Err(HomeError::MissingDependency(_))
        ));
        assert!(!cloud.is_ready());
    }

    #[tokio::test]
    async fn test_init_restores_saved_account() {
        let f = fixture().await;
        let saved = AccountDevices::open(&Replica::new(), f.owner.hash(), &HomeConfig::default())
            .unwrap();
        let other_device = Device::new(f.owner.hash());
        saved.add_device(other_device.clone()).unwrap();
        saved
            .add_linkup_server(
                &f.owner.hash(),
                crate::types::LinkupServer::new("https://relay.example.com").unwrap(),
            )
            .unwrap();
        saved.save_to(f.store.as_ref()).await.unwrap();

        let cloud = cloud(&f);
        cloud.init().await.unwrap();
        let account = cloud.account().unwrap();
        assert!(account.devices().has(&other_device.hash()));
        assert!(account.devices().has(&f.device.hash()));
        assert_eq!(account.linkup_locator(), "https://relay.example.com");

        cloud.start().await.unwrap();
        let local = f.mesh.local_peer(&cloud.group_id()).unwrap();
        assert!(local.endpoint.starts_with("https://relay.example.com"));
    }

    #[tokio::test]
    async fn test_init_and_start() {
        let f = fixture().await;
        let cloud = cloud(&f);
        cloud.init().await.unwrap();
        cloud.init().await.unwrap();

        let account = cloud.account().unwrap();
        assert!(account.devices().has(&f.device.hash()));
        assert_eq!(
            cloud.group_id(),
            format!("hhs-home-{}-devices", f.owner.hash())
        );

        cloud.start().await.unwrap();
        assert!(f.mesh.is_member(&cloud.group_id()));
        assert_eq!(f.mesh.synced_objects(&cloud.group_id()), account.root_objects());

        cloud
            .add_sync_target(Arc::new(ObjectRef::new("extra")))
            .await
            .unwrap();
        assert!(f
            .mesh
            .synced_objects(&cloud.group_id())
            .contains(&ObjectRef::new("extra")));

        cloud.stop().await.unwrap();
        assert!(!f.mesh.is_member(&cloud.group_id()));
    }
}
