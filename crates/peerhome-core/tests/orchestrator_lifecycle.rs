//! Integration tests for the contacts orchestrator
//!
//! Drives `Contacts` through its public API against an in-process mesh and
//! checks what the mesh was asked to do: which groups were joined, which
//! objects were synced, and that removed relationships leave nothing
//! behind.

use std::sync::Arc;

use peerhome_core::group::contact_pair_group_id;
use peerhome_core::{
    AddressBook, Contacts, Device, DeviceCloud, GroupKind, HomeConfig, HomeEvent, Identity,
    MemoryMesh, MemoryStore, Module, Replica, Store,
};

struct Node {
    owner: Identity,
    mesh: Arc<MemoryMesh>,
    cloud: DeviceCloud,
    contacts: Contacts,
}

async fn seed(store: &MemoryStore, name: &str) -> (Identity, Device) {
    let owner = Identity::generate(Some(name));
    let device = Device::new(owner.hash());
    store.save(&owner.clone().into()).await.unwrap();
    store.save(&device.clone().into()).await.unwrap();
    (owner, device)
}

async fn node_with(replica: Arc<Replica>, config: HomeConfig, name: &str) -> Node {
    let store = Arc::new(MemoryStore::new());
    let mesh = Arc::new(MemoryMesh::new());
    let (owner, device) = seed(&store, name).await;

    let cloud = DeviceCloud::new(
        owner.hash(),
        device.hash(),
        config,
        store.clone(),
        mesh.clone(),
        replica.clone(),
    );
    cloud.init().await.unwrap();
    let contacts = Contacts::init(&cloud, replica, store, mesh.clone())
        .await
        .unwrap();

    Node {
        owner,
        mesh,
        cloud,
        contacts,
    }
}

async fn node(name: &str) -> Node {
    node_with(Arc::new(Replica::new()), HomeConfig::default(), name).await
}

#[tokio::test]
async fn test_add_then_remove_leaves_no_group() {
    let love = node("Love").await;
    love.contacts.start().await.unwrap();
    let joy = Identity::generate(Some("Joy"));

    // Remove before the provisioning task has had a chance to run
    love.contacts.add_contact(joy.clone()).await.unwrap();
    love.contacts.remove_contact(&joy.hash());
    love.contacts.settle().await;

    let group_id = contact_pair_group_id("hhs-home", &love.owner.hash(), &joy.hash());
    assert!(love.contacts.contact_group_ids().is_empty());
    assert!(!love.mesh.is_member(&group_id));
    assert_eq!(love.mesh.join_count(&group_id), 0);
}

#[tokio::test]
async fn test_remove_then_readd_keeps_one_group() {
    let love = node("Love").await;
    love.contacts.start().await.unwrap();
    let joy = Identity::generate(Some("Joy"));

    love.contacts.add_contact(joy.clone()).await.unwrap();
    love.contacts.settle().await;
    let group = love.contacts.contact_group(&joy.hash()).unwrap();

    love.contacts.remove_contact(&joy.hash());
    love.contacts.add_contact(joy.clone()).await.unwrap();
    love.contacts.settle().await;

    let kept = love.contacts.contact_group(&joy.hash()).unwrap();
    assert!(Arc::ptr_eq(&group, &kept));
    assert!(love.mesh.is_member(group.id()));
    assert_eq!(love.mesh.join_count(group.id()), 1);
}

#[tokio::test]
async fn test_groups_follow_module_start_and_stop() {
    let love = node("Love").await;
    let joy = Identity::generate(Some("Joy"));
    let peace = Identity::generate(Some("Peace"));

    love.contacts.add_contact(joy.clone()).await.unwrap();
    love.contacts.add_contact(peace.clone()).await.unwrap();
    love.contacts.settle().await;
    assert_eq!(love.contacts.contact_group_ids().len(), 2);
    assert!(love.mesh.group_ids().is_empty());

    love.contacts.start().await.unwrap();
    love.contacts.start().await.unwrap();
    assert_eq!(love.mesh.group_ids(), love.contacts.contact_group_ids());

    love.contacts.stop().await.unwrap();
    assert!(love.mesh.group_ids().is_empty());
    assert_eq!(love.contacts.contact_group_ids().len(), 2);

    love.contacts.start().await.unwrap();
    for id in love.contacts.contact_group_ids() {
        assert_eq!(love.mesh.join_count(&id), 2);
    }
}

#[tokio::test]
async fn test_existing_contacts_are_provisioned_on_init() {
    let replica = Arc::new(Replica::new());
    let store = Arc::new(MemoryStore::new());
    let mesh = Arc::new(MemoryMesh::new());
    let (owner, device) = seed(&store, "Love").await;
    let joy = Identity::generate(Some("Joy"));

    // Another device of the same owner already recorded Joy
    AddressBook::open(&replica, owner.hash())
        .unwrap()
        .contacts
        .add(joy.clone());

    let cloud = DeviceCloud::new(
        owner.hash(),
        device.hash(),
        HomeConfig::default(),
        store.clone(),
        mesh.clone(),
        replica.clone(),
    );
    cloud.init().await.unwrap();
    let contacts = Contacts::init(&cloud, replica, store, mesh).await.unwrap();
    contacts.settle().await;

    assert!(contacts.contact_group(&joy.hash()).is_some());
}

#[tokio::test]
async fn test_contact_group_spans_both_accounts() {
    let replica = Arc::new(Replica::new());
    let love = node_with(replica.clone(), HomeConfig::default(), "Love").await;
    let joy = node_with(replica, HomeConfig::default(), "Joy").await;
    love.contacts.start().await.unwrap();

    love.contacts.add_contact(joy.owner.clone()).await.unwrap();
    love.contacts.settle().await;

    let group = love.contacts.contact_group(&joy.owner.hash()).unwrap();
    let peers = love.mesh.discover(group.id(), 10).await.unwrap();
    let mut owners: Vec<_> = peers.iter().map(|p| p.identity_hash.clone()).collect();
    owners.sort();
    let mut expected = vec![love.owner.hash(), joy.owner.hash()];
    expected.sort();
    assert_eq!(owners.into_iter().flatten().collect::<Vec<_>>(), expected);

    let joy_device = joy.cloud.local_device().unwrap();
    let joy_peer = joy.cloud.account().unwrap().peer_for_device(&joy_device);
    assert_eq!(
        love.mesh.resolve(group.id(), &joy_peer.endpoint).await.unwrap(),
        Some(joy_peer)
    );
}

#[tokio::test]
async fn test_sync_with_contact_attaches_target() {
    let love = node("Love").await;
    love.contacts.start().await.unwrap();
    let joy = Identity::generate(Some("Joy"));
    love.contacts.add_contact(joy.clone()).await.unwrap();
    love.contacts.settle().await;

    let shared = peerhome_core::ObjectRef::new("shared-notes");
    assert!(love
        .contacts
        .sync_with_contact(&joy.hash(), Arc::new(shared.clone()))
        .await
        .unwrap());

    let group_id = love.contacts.contact_group(&joy.hash()).unwrap().id().to_string();
    assert!(love.mesh.synced_objects(&group_id).contains(&shared));
}

#[tokio::test]
async fn test_removal_event_and_custom_prefix() {
    let config = HomeConfig::default().with_group_prefix("test-home");
    let love = node_with(Arc::new(Replica::new()), config, "Love").await;
    let mut events = love.contacts.subscribe();
    let joy = Identity::generate(Some("Joy"));

    love.contacts.add_contact(joy.clone()).await.unwrap();
    love.contacts.settle().await;
    love.contacts.remove_contact(&joy.hash());
    love.contacts.settle().await;

    let group_id = contact_pair_group_id("test-home", &love.owner.hash(), &joy.hash());
    assert_eq!(
        events.recv().await.unwrap(),
        HomeEvent::GroupProvisioned {
            group_id: group_id.clone(),
            kind: GroupKind::ContactPair,
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        HomeEvent::GroupRemoved { group_id }
    );
}
