//! End-to-end invite handshake between two identities
//!
//! Each party has its own mesh, while both share one `Replica` standing in
//! for the converged CRDT state. The test follows a token from minting to
//! a contact-pair group on both sides.

use std::sync::Arc;

use peerhome_core::group::{contact_pair_group_id, invite_group_id};
use peerhome_core::{
    Contacts, Device, DeviceCloud, HomeConfig, HomeEvent, Identity, InviteReply, InviteToken,
    MemoryMesh, MemoryStore, Module, Replica, Store,
};

struct Party {
    owner: Identity,
    device: Device,
    mesh: Arc<MemoryMesh>,
    store: Arc<MemoryStore>,
    contacts: Contacts,
}

async fn party(replica: &Arc<Replica>, name: &str) -> Party {
    let store = Arc::new(MemoryStore::new());
    let mesh = Arc::new(MemoryMesh::new());
    let owner = Identity::generate(Some(name));
    let device = Device::new(owner.hash());
    store.save(&owner.clone().into()).await.unwrap();
    store.save(&device.clone().into()).await.unwrap();

    let cloud = DeviceCloud::new(
        owner.hash(),
        device.hash(),
        HomeConfig::default(),
        store.clone(),
        mesh.clone(),
        replica.clone(),
    );
    cloud.init().await.unwrap();
    cloud.start().await.unwrap();

    let contacts = Contacts::init(&cloud, replica.clone(), store.clone(), mesh.clone())
        .await
        .unwrap();
    contacts.start().await.unwrap();

    Party {
        owner,
        device,
        mesh,
        store,
        contacts,
    }
}

#[tokio::test]
async fn test_full_handshake() {
    let _ = tracing_subscriber::fmt::try_init();
    let replica = Arc::new(Replica::new());
    let love = party(&replica, "Love").await;
    let joy = party(&replica, "Joy").await;
    let mut love_events = love.contacts.subscribe();

    // Love mints an invite and hands the token over out of band
    let invite = love.contacts.create_invite("Joy").await.unwrap();
    love.contacts.settle().await;
    let token_hash = invite.hash();
    let invite_group = invite_group_id("hhs-home", &token_hash);
    assert!(love.mesh.is_member(&invite_group));
    assert!(invite.token.sender_devices.contains(&love.device.hash()));

    let shared = invite.token.encode().unwrap();
    let token = InviteToken::decode(&shared).unwrap();

    // Joy accepts and joins the same group under an encrypted endpoint
    assert!(joy.contacts.receive_token(token.clone()));
    joy.contacts.accept_invite(token).unwrap();
    joy.contacts.settle().await;
    assert!(joy.contacts.address_book().received_tokens.is_empty());
    assert!(joy.mesh.is_member(&invite_group));

    let joy_endpoint = joy.mesh.local_peer(&invite_group).unwrap().endpoint;
    assert!(!joy_endpoint.contains(joy.owner.hash().as_str()));

    // Only the token holder can tell who is behind that endpoint
    let resolved = love
        .mesh
        .resolve(&invite_group, &joy_endpoint)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.identity_hash, Some(joy.owner.hash()));

    // Joy finds Love's devices from the token alone
    let love_peers = joy.mesh.discover(&invite_group, 10).await.unwrap();
    assert_eq!(love_peers.len(), 1);
    assert_eq!(love_peers[0].identity_hash, Some(love.owner.hash()));

    // Love verifies the reply and gains a contact
    let contact = love.contacts.complete_invite(&token_hash).await.unwrap();
    assert_eq!(contact, Some(joy.owner.hash()));
    love.contacts.settle().await;
    assert!(!love.mesh.is_member(&invite_group));
    assert!(love.contacts.invite_group_ids().is_empty());

    // Joy learns Love's identity from the sender slot
    let contact = joy.contacts.complete_acceptance(&token_hash).await.unwrap();
    assert_eq!(contact, Some(love.owner.hash()));
    joy.contacts.settle().await;
    assert!(!joy.mesh.is_member(&invite_group));

    let pair = contact_pair_group_id("hhs-home", &love.owner.hash(), &joy.owner.hash());
    assert_eq!(love.contacts.contact_group_ids(), vec![pair.clone()]);
    assert_eq!(joy.contacts.contact_group_ids(), vec![pair.clone()]);
    assert!(love.mesh.is_member(&pair));
    assert!(joy.mesh.is_member(&pair));

    // The new contacts were persisted
    assert!(love.store.load(&joy.owner.hash()).await.unwrap().is_some());
    assert!(joy.store.load(&love.owner.hash()).await.unwrap().is_some());

    let mut completed = None;
    while let Ok(event) = love_events.try_recv() {
        if let HomeEvent::InviteCompleted { contact, .. } = event {
            completed = Some(contact);
        }
    }
    assert_eq!(completed, Some(joy.owner.hash()));
}

#[tokio::test]
async fn test_forged_reply_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();
    let replica = Arc::new(Replica::new());
    let love = party(&replica, "Love").await;
    let invite = love.contacts.create_invite("someone").await.unwrap();
    love.contacts.settle().await;

    // A reply computed for a different token
    let other = InviteToken::from_secret(
        "00112233445566778899aabbccddeeff",
        love.owner.hash(),
        [love.device.hash()],
        "wss://relay",
    )
    .unwrap();
    let mallory = Identity::generate(Some("Mallory"));
    let forged = InviteReply::new(mallory, &other).unwrap();
    replica
        .reference::<InviteReply>(&invite.token.reply_slot_id())
        .unwrap()
        .set_value(forged);

    assert_eq!(love.contacts.complete_invite(&invite.hash()).await.unwrap(), None);
    assert!(love.contacts.address_book().contacts.is_empty());
    assert!(love.contacts.invite_group(&invite.hash()).is_some());
}

#[tokio::test]
async fn test_complete_without_reply_waits() {
    let replica = Arc::new(Replica::new());
    let love = party(&replica, "Love").await;
    let invite = love.contacts.create_invite("someone").await.unwrap();

    assert_eq!(love.contacts.complete_invite(&invite.hash()).await.unwrap(), None);
    assert!(love.contacts.address_book().sent_invites.has(&invite.hash()));
}

#[tokio::test]
async fn test_cancel_invite_tears_group_down() {
    let replica = Arc::new(Replica::new());
    let love = party(&replica, "Love").await;
    let invite = love.contacts.create_invite("someone").await.unwrap();
    love.contacts.settle().await;
    let group_id = invite_group_id("hhs-home", &invite.hash());
    assert!(love.mesh.is_member(&group_id));

    assert!(love.contacts.cancel_invite(&invite.hash()));
    love.contacts.settle().await;
    assert!(!love.mesh.is_member(&group_id));
    assert!(love.mesh.synced_objects(&group_id).is_empty());
}

#[tokio::test]
async fn test_invite_cancelled_while_provisioning_leaves_no_group() {
    let replica = Arc::new(Replica::new());
    let love = party(&replica, "Love").await;

    let invite = love.contacts.create_invite("someone").await.unwrap();
    assert!(love.contacts.cancel_invite(&invite.hash()));
    love.contacts.settle().await;

    let group_id = invite_group_id("hhs-home", &invite.hash());
    assert!(love.contacts.invite_group_ids().is_empty());
    assert!(!love.mesh.is_member(&group_id));
    assert_eq!(love.mesh.join_count(&group_id), 0);
}

#[tokio::test]
async fn test_invite_cancel_then_resend_keeps_one_group() {
    let replica = Arc::new(Replica::new());
    let love = party(&replica, "Love").await;
    let invite = love.contacts.create_invite("someone").await.unwrap();
    love.contacts.settle().await;
    let group = love.contacts.invite_group(&invite.hash()).unwrap();

    let sent = &love.contacts.address_book().sent_invites;
    let removed = sent.delete(&invite.hash()).unwrap();
    sent.add(removed);
    love.contacts.settle().await;

    let kept = love.contacts.invite_group(&invite.hash()).unwrap();
    assert!(Arc::ptr_eq(&group, &kept));
    assert_eq!(love.contacts.invite_group_ids(), vec![group.id().to_string()]);
    assert!(love.mesh.is_member(group.id()));
    assert_eq!(love.mesh.join_count(group.id()), 1);
}

#[tokio::test]
async fn test_accepted_token_dropped_while_provisioning_leaves_no_group() {
    let replica = Arc::new(Replica::new());
    let love = party(&replica, "Love").await;
    let joy = party(&replica, "Joy").await;
    let invite = love.contacts.create_invite("Joy").await.unwrap();
    love.contacts.settle().await;

    joy.contacts.accept_invite(invite.token.clone()).unwrap();
    assert!(joy
        .contacts
        .address_book()
        .accepted_tokens
        .delete(&invite.hash())
        .is_some());
    joy.contacts.settle().await;

    let group_id = invite_group_id("hhs-home", &invite.hash());
    assert!(joy.contacts.invite_group_ids().is_empty());
    assert!(!joy.mesh.is_member(&group_id));
    assert_eq!(joy.mesh.join_count(&group_id), 0);
}

#[tokio::test]
async fn test_accepted_token_dropped_then_restored_keeps_one_group() {
    let replica = Arc::new(Replica::new());
    let love = party(&replica, "Love").await;
    let joy = party(&replica, "Joy").await;
    let invite = love.contacts.create_invite("Joy").await.unwrap();
    love.contacts.settle().await;

    joy.contacts.accept_invite(invite.token.clone()).unwrap();
    joy.contacts.settle().await;
    let group = joy.contacts.invite_group(&invite.hash()).unwrap();

    let accepted = &joy.contacts.address_book().accepted_tokens;
    let token = accepted.delete(&invite.hash()).unwrap();
    accepted.add(token);
    joy.contacts.settle().await;

    let kept = joy.contacts.invite_group(&invite.hash()).unwrap();
    assert!(Arc::ptr_eq(&group, &kept));
    assert!(joy.mesh.is_member(group.id()));
    assert_eq!(joy.mesh.join_count(group.id()), 1);

    accepted.delete(&invite.hash());
    joy.contacts.settle().await;
    assert!(joy.contacts.invite_group_ids().is_empty());
    assert!(!joy.mesh.is_member(group.id()));
}
