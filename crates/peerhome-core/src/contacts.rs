//! Dynamic peer-group orchestration for contacts and invites
//!
//! [`Contacts`] watches the owner's address book and keeps one peer group
//! alive per relationship:
//!
//! | set                | key          | group                                  |
//! |--------------------|--------------|----------------------------------------|
//! | contacts           | contact hash | contact pair (own + contact devices)   |
//! | sent invites       | token hash   | invite, sender role                    |
//! | accepted tokens    | token hash   | invite, receiver role                  |
//!
//! Each relationship moves through `absent → provisioned → connected`.
//! Additions provision a group and hand it to the module's [`ModuleSyncs`],
//! which connects it if the module is started; deletions release it from
//! there, leave the mesh and discard it.
//!
//! ## Concurrency
//!
//! Set handlers run synchronously inside whatever changed the set, so they
//! only spawn a task and return. The per-relationship maps sit behind a
//! `parking_lot::Mutex` that is never held across an await. A slot is
//! reserved as `Provisioning(generation)` before any await; when the
//! provisioning task finishes it installs the group only if its own
//! reservation is still there and the element is still in the set.
//! Otherwise it tears down what it built, so an add quickly followed by a
//! remove leaves nothing behind. Installing and tearing down hold the
//! `lifecycle` lock so the slot maps and `ModuleSyncs` change together.
//!
//! Handler tasks live in a `JoinSet`; finished ones are reaped on every
//! spawn, so the set only holds work still in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::account::AccountDevices;
use crate::config::HomeConfig;
use crate::device_cloud::DeviceCloud;
use crate::error::{HomeError, HomeResult};
use crate::group::{contact_pair_group_id, invite_group_id, ObjectRef, PeerGroup, SyncTarget};
use crate::invite::{Invite, InviteReply, InviteToken};
use crate::mesh::Mesh;
use crate::module::{Module, ModuleSyncs};
use crate::peers::{InviteReceiverSource, InviteSenderSource, JoinedPeerSource, PeerSource};
use crate::replica::{Replica, ReplicatedRef, ReplicatedSet};
use crate::storage::{self, Store};
use crate::types::{Device, Identity, ObjectHash};

/// What kind of relationship a group serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    ContactPair,
    InviteSender,
    InviteReceiver,
}

/// Orchestrator events, broadcast to every subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomeEvent {
    /// A relationship's peer group was created
    GroupProvisioned { group_id: String, kind: GroupKind },
    /// A peer group joined the mesh
    GroupConnected { group_id: String },
    /// A peer group was torn down
    GroupRemoved { group_id: String },
    /// An invite handshake finished and the counterpart became a contact
    InviteCompleted {
        token_hash: ObjectHash,
        contact: ObjectHash,
    },
}

/// The owner's replicated address book
#[derive(Clone, Debug)]
pub struct AddressBook {
    owner: ObjectHash,
    pub contacts: ReplicatedSet<Identity>,
    pub sent_invites: ReplicatedSet<Invite>,
    pub received_tokens: ReplicatedSet<InviteToken>,
    pub accepted_tokens: ReplicatedSet<InviteToken>,
}

impl AddressBook {
    pub fn id_for(owner: &ObjectHash) -> String {
        format!("contacts-for-{}", owner)
    }

    /// Open fresh views over `owner`'s address book
    pub fn open(replica: &Replica, owner: ObjectHash) -> HomeResult<Self> {
        let id = Self::id_for(&owner);
        Ok(Self {
            contacts: replica.set(&format!("{}/contacts", id))?,
            sent_invites: replica.set(&format!("{}/sent-invites", id))?,
            received_tokens: replica.set(&format!("{}/received-invite-tokens", id))?,
            accepted_tokens: replica.set(&format!("{}/accepted-invite-tokens", id))?,
            owner,
        })
    }

    pub fn owner(&self) -> &ObjectHash {
        &self.owner
    }
}

impl SyncTarget for AddressBook {
    fn target_id(&self) -> String {
        Self::id_for(&self.owner)
    }

    fn root_objects(&self) -> Vec<ObjectRef> {
        vec![
            self.contacts.object_ref(),
            self.sent_invites.object_ref(),
            self.received_tokens.object_ref(),
            self.accepted_tokens.object_ref(),
        ]
    }
}

enum Slot {
    Provisioning(u64),
    Ready(Arc<PeerGroup>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Sender,
    Receiver,
}

struct Inner {
    owner: Identity,
    local_device: Device,
    config: HomeConfig,
    store: Arc<dyn Store>,
    mesh: Arc<dyn Mesh>,
    replica: Arc<Replica>,
    book: AddressBook,
    contact_groups: Mutex<HashMap<ObjectHash, Slot>>,
    invite_groups: Mutex<HashMap<ObjectHash, Slot>>,
    syncs: ModuleSyncs,
    lifecycle: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
    event_tx: broadcast::Sender<HomeEvent>,
}

/// Contacts module: address book plus its dynamic peer groups
#[derive(Clone)]
pub struct Contacts {
    inner: Arc<Inner>,
}

impl Contacts {
    /// Build the orchestrator on top of an initialized device cloud.
    ///
    /// Registers the set handlers, starts watching the address book
    /// (provisioning a group for every existing relationship) and shares
    /// the address book with the owner's other devices.
    ///
    /// # Errors
    ///
    /// Returns `HomeError::Uninitialized` if `cloud` has not been
    /// initialized.
    pub async fn init(
        cloud: &DeviceCloud,
        replica: Arc<Replica>,
        store: Arc<dyn Store>,
        mesh: Arc<dyn Mesh>,
    ) -> HomeResult<Self> {
        let owner = cloud.owner()?;
        let local_device = cloud.local_device()?;
        let config = cloud.config().clone();
        let book = AddressBook::open(&replica, owner.hash())?;
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let inner = Arc::new(Inner {
            owner,
            local_device,
            config,
            store,
            mesh,
            replica,
            book,
            contact_groups: Mutex::new(HashMap::new()),
            invite_groups: Mutex::new(HashMap::new()),
            syncs: ModuleSyncs::new("contacts"),
            lifecycle: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(JoinSet::new()),
            event_tx,
        });
        Inner::register_handlers(&inner);

        inner.book.contacts.load_and_watch_for_changes().await;
        inner.book.sent_invites.load_and_watch_for_changes().await;
        inner.book.accepted_tokens.load_and_watch_for_changes().await;

        cloud.add_sync_target(Arc::new(inner.book.clone())).await?;

        info!(owner = %inner.owner.hash(), "contacts ready");
        Ok(Self { inner })
    }

    pub fn owner(&self) -> &Identity {
        &self.inner.owner
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.inner.book
    }

    /// Subscribe to orchestrator events
    pub fn subscribe(&self) -> broadcast::Receiver<HomeEvent> {
        self.inner.event_tx.subscribe()
    }

    pub async fn is_started(&self) -> bool {
        self.inner.syncs.is_active().await
    }

    /// Ids of the groups currently held for start/stop, in insertion order
    pub async fn module_group_ids(&self) -> Vec<String> {
        self.inner.syncs.group_ids().await
    }

    /// Number of handler tasks still running
    pub fn pending_tasks(&self) -> usize {
        let mut tasks = self.inner.tasks.lock();
        reap(&mut tasks);
        tasks.len()
    }

    /// Wait until every in-flight handler task, including tasks spawned
    /// by those tasks, has finished.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.inner.tasks.lock());
            if pending.is_empty() {
                return;
            }
            while let Some(result) = pending.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "orchestrator task failed");
                }
            }
        }
    }

    /// Add an identity to the address book.
    pub async fn add_contact(&self, contact: Identity) -> HomeResult<bool> {
        self.inner.store.save(&contact.clone().into()).await?;
        Ok(self.inner.book.contacts.add(contact))
    }

    /// Remove an identity from the address book.
    pub fn remove_contact(&self, contact: &ObjectHash) -> bool {
        self.inner.book.contacts.delete(contact).is_some()
    }

    /// Mint an invite for `intended_recipient` and record it as sent.
    ///
    /// The token lists the owner's current devices and linkup locator, and
    /// the owner is written into the token's sender slot.
    pub async fn create_invite(&self, intended_recipient: &str) -> HomeResult<Invite> {
        let inner = &self.inner;
        let account = inner.own_account()?;
        let token = InviteToken::new(
            &inner.owner,
            account.devices().values().iter(),
            account.linkup_locator(),
            inner.config.secret_bits,
        );

        inner.sender_slot(&token)?.set_value(inner.owner.clone());
        let invite = Invite::new(token, intended_recipient);
        inner.book.sent_invites.add(invite.clone());

        info!(token = %invite.hash(), recipient = %intended_recipient, "invite created");
        Ok(invite)
    }

    /// Withdraw a sent invite, tearing its group down.
    pub fn cancel_invite(&self, token_hash: &ObjectHash) -> bool {
        self.inner.book.sent_invites.delete(token_hash).is_some()
    }

    /// Record a token that arrived out of band, without acting on it yet.
    pub fn receive_token(&self, token: InviteToken) -> bool {
        self.inner.book.received_tokens.add(token)
    }

    /// Accept an invite: provision the receiver-side group and answer in
    /// the token's reply slot.
    pub fn accept_invite(&self, token: InviteToken) -> HomeResult<()> {
        let inner = &self.inner;
        let reply = InviteReply::new(inner.owner.clone(), &token)?;
        inner.reply_slot(&token)?.set_value(reply);

        inner.book.received_tokens.delete(&token.hash());
        info!(token = %token.hash(), sender = %token.sender_identity_hash, "invite accepted");
        inner.book.accepted_tokens.add(token);
        Ok(())
    }

    /// Sender side: turn a verified reply into a contact.
    ///
    /// Returns the new contact's hash, or `None` if there is no such sent
    /// invite, no reply yet, or a reply that does not verify.
    pub async fn complete_invite(&self, token_hash: &ObjectHash) -> HomeResult<Option<ObjectHash>> {
        let inner = &self.inner;
        let Some(invite) = inner.book.sent_invites.get(token_hash) else {
            return Ok(None);
        };
        let Some(reply) = inner.reply_slot(&invite.token)?.value() else {
            debug!(token = %token_hash, "no reply yet");
            return Ok(None);
        };
        if !reply.verify(&invite.token) {
            warn!(token = %token_hash, "invite reply failed verification");
            return Ok(None);
        }

        let contact = reply.receiver_identity;
        let contact_hash = contact.hash();
        self.add_contact(contact).await?;
        inner.book.sent_invites.delete(token_hash);

        info!(token = %token_hash, contact = %contact_hash, "invite completed");
        inner.emit(HomeEvent::InviteCompleted {
            token_hash: token_hash.clone(),
            contact: contact_hash.clone(),
        });
        Ok(Some(contact_hash))
    }

    /// Receiver side: add the inviter as a contact once known.
    ///
    /// The inviter's identity comes from the sender slot, or failing that
    /// from the store. It must hash to the sender named in the token.
    pub async fn complete_acceptance(
        &self,
        token_hash: &ObjectHash,
    ) -> HomeResult<Option<ObjectHash>> {
        let inner = &self.inner;
        let Some(token) = inner.book.accepted_tokens.get(token_hash) else {
            return Ok(None);
        };

        let sender = match inner.sender_slot(&token)?.value() {
            Some(sender) => Some(sender),
            None => {
                storage::load_identity(inner.store.as_ref(), &token.sender_identity_hash).await?
            }
        };
        let Some(sender) = sender else {
            debug!(token = %token_hash, "sender identity not available yet");
            return Ok(None);
        };
        if sender.hash() != token.sender_identity_hash {
            warn!(token = %token_hash, "sender slot does not match token");
            return Ok(None);
        }

        let contact_hash = sender.hash();
        self.add_contact(sender).await?;
        inner.book.accepted_tokens.delete(token_hash);

        info!(token = %token_hash, contact = %contact_hash, "acceptance completed");
        inner.emit(HomeEvent::InviteCompleted {
            token_hash: token_hash.clone(),
            contact: contact_hash.clone(),
        });
        Ok(Some(contact_hash))
    }

    /// Keep another object in sync with a contact.
    ///
    /// # Errors
    ///
    /// Returns `HomeError::Uninitialized` if the contact's group has not
    /// finished provisioning.
    pub async fn sync_with_contact(
        &self,
        contact: &ObjectHash,
        target: Arc<dyn SyncTarget>,
    ) -> HomeResult<bool> {
        let group = self.contact_group(contact).ok_or_else(|| {
            HomeError::Uninitialized(format!("peer group for contact {}", contact))
        })?;
        group.add_sync_target(target).await
    }

    /// Ready contact-pair group for a contact
    pub fn contact_group(&self, contact: &ObjectHash) -> Option<Arc<PeerGroup>> {
        ready_group(&self.inner.contact_groups, contact)
    }

    /// Ready invite group for a token
    pub fn invite_group(&self, token_hash: &ObjectHash) -> Option<Arc<PeerGroup>> {
        ready_group(&self.inner.invite_groups, token_hash)
    }

    /// Ids of ready contact-pair groups, sorted
    pub fn contact_group_ids(&self) -> Vec<String> {
        ready_ids(&self.inner.contact_groups)
    }

    /// Ids of ready invite groups, sorted
    pub fn invite_group_ids(&self) -> Vec<String> {
        ready_ids(&self.inner.invite_groups)
    }
}

fn ready_group(map: &Mutex<HashMap<ObjectHash, Slot>>, key: &ObjectHash) -> Option<Arc<PeerGroup>> {
    match map.lock().get(key) {
        Some(Slot::Ready(group)) => Some(group.clone()),
        _ => None,
    }
}

fn ready_groups(map: &Mutex<HashMap<ObjectHash, Slot>>) -> Vec<Arc<PeerGroup>> {
    map.lock()
        .values()
        .filter_map(|slot| match slot {
            Slot::Ready(group) => Some(group.clone()),
            Slot::Provisioning(_) => None,
        })
        .collect()
}

fn ready_ids(map: &Mutex<HashMap<ObjectHash, Slot>>) -> Vec<String> {
    let mut ids: Vec<String> = ready_groups(map)
        .iter()
        .map(|g| g.id().to_string())
        .collect();
    ids.sort();
    ids
}

#[async_trait]
impl Module for Contacts {
    async fn start(&self) -> HomeResult<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.syncs.is_active().await {
            return Ok(());
        }

        inner.syncs.start().await?;
        for group in inner.syncs.groups().await {
            inner.emit_if_connected(&group).await;
        }
        Ok(())
    }

    async fn stop(&self) -> HomeResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.syncs.stop().await
    }
}

impl Inner {
    fn register_handlers(this: &Arc<Self>) {
        let book = &this.book;

        let weak = Arc::downgrade(this);
        book.contacts.on_addition(move |contact: &Identity| {
            let contact = contact.clone();
            spawn_handler(&weak, move |inner| async move {
                inner.provision_contact(contact).await
            });
        });

        let weak = Arc::downgrade(this);
        book.contacts.on_deletion(move |contact: &Identity| {
            let key = contact.hash();
            spawn_handler(&weak, move |inner| async move {
                inner.teardown_contact(key).await
            });
        });

        let weak = Arc::downgrade(this);
        book.sent_invites.on_addition(move |invite: &Invite| {
            let token = invite.token.clone();
            spawn_handler(&weak, move |inner| async move {
                inner.provision_invite(token, Role::Sender).await
            });
        });

        let weak = Arc::downgrade(this);
        book.sent_invites.on_deletion(move |invite: &Invite| {
            let key = invite.hash();
            spawn_handler(&weak, move |inner| async move {
                inner.teardown_invite(key, Role::Sender).await
            });
        });

        let weak = Arc::downgrade(this);
        book.accepted_tokens.on_addition(move |token: &InviteToken| {
            let token = token.clone();
            spawn_handler(&weak, move |inner| async move {
                inner.provision_invite(token, Role::Receiver).await
            });
        });

        let weak = Arc::downgrade(this);
        book.accepted_tokens.on_deletion(move |token: &InviteToken| {
            let key = token.hash();
            spawn_handler(&weak, move |inner| async move {
                inner.teardown_invite(key, Role::Receiver).await
            });
        });
    }

    fn emit(&self, event: HomeEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn own_account(&self) -> HomeResult<AccountDevices> {
        AccountDevices::open(&self.replica, self.owner.hash(), &self.config)
    }

    fn sender_slot(&self, token: &InviteToken) -> HomeResult<ReplicatedRef<Identity>> {
        self.replica.reference(&token.sender_slot_id())
    }

    fn reply_slot(&self, token: &InviteToken) -> HomeResult<ReplicatedRef<InviteReply>> {
        self.replica.reference(&token.reply_slot_id())
    }

    fn still_wanted(&self, key: &ObjectHash, kind: GroupKind) -> bool {
        match kind {
            GroupKind::ContactPair => self.book.contacts.has(key),
            GroupKind::InviteSender => self.book.sent_invites.has(key),
            GroupKind::InviteReceiver => self.book.accepted_tokens.has(key),
        }
    }

    fn slots(&self, kind: GroupKind) -> &Mutex<HashMap<ObjectHash, Slot>> {
        match kind {
            GroupKind::ContactPair => &self.contact_groups,
            GroupKind::InviteSender | GroupKind::InviteReceiver => &self.invite_groups,
        }
    }

    /// Reserve a slot. Returns the reservation's generation, or `None` if
    /// the relationship is already provisioned or being provisioned.
    fn reserve(&self, key: &ObjectHash, kind: GroupKind) -> Option<u64> {
        let mut slots = self.slots(kind).lock();
        if slots.contains_key(key) {
            return None;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        slots.insert(key.clone(), Slot::Provisioning(generation));
        Some(generation)
    }

    /// Drop a reservation if it is still ours.
    fn release(&self, key: &ObjectHash, kind: GroupKind, generation: u64) {
        let mut slots = self.slots(kind).lock();
        if matches!(slots.get(key), Some(Slot::Provisioning(g)) if *g == generation) {
            slots.remove(key);
        }
    }

    /// Install a freshly built group if its reservation is still current.
    async fn install(
        &self,
        key: ObjectHash,
        kind: GroupKind,
        generation: u64,
        built: HomeResult<Arc<PeerGroup>>,
    ) -> HomeResult<()> {
        let group = match built {
            Ok(group) => group,
            Err(e) => {
                self.release(&key, kind, generation);
                warn!(%key, ?kind, error = %e, "provisioning failed");
                return Err(e);
            }
        };

        let _lifecycle = self.lifecycle.lock().await;
        let installed = self.still_wanted(&key, kind) && {
            let mut slots = self.slots(kind).lock();
            let current = matches!(
                slots.get(&key),
                Some(Slot::Provisioning(g)) if *g == generation
            );
            if current {
                slots.insert(key.clone(), Slot::Ready(group.clone()));
            }
            current
        };
        if !installed {
            self.release(&key, kind, generation);
            debug!(%key, group_id = %group.id(), "relationship gone before provisioning finished");
            return group.deinit().await;
        }

        info!(%key, group_id = %group.id(), ?kind, "peer group provisioned");
        self.emit(HomeEvent::GroupProvisioned {
            group_id: group.id().to_string(),
            kind,
        });
        self.syncs.add_module_sync(group.clone()).await?;
        self.emit_if_connected(&group).await;
        Ok(())
    }

    async fn emit_if_connected(&self, group: &PeerGroup) {
        if group.is_connected().await {
            self.emit(HomeEvent::GroupConnected {
                group_id: group.id().to_string(),
            });
        }
    }

    async fn provision_contact(self: Arc<Self>, contact: Identity) -> HomeResult<()> {
        let key = contact.hash();
        let Some(generation) = self.reserve(&key, GroupKind::ContactPair) else {
            debug!(contact = %key, "contact already provisioned");
            return Ok(());
        };
        let built = self.build_contact_group(&contact).await;
        self.install(key, GroupKind::ContactPair, generation, built)
            .await
    }

    async fn build_contact_group(&self, contact: &Identity) -> HomeResult<Arc<PeerGroup>> {
        let contact_hash = contact.hash();
        let own = self.own_account()?;
        let theirs = AccountDevices::open(&self.replica, contact_hash.clone(), &self.config)?;
        own.load_and_watch_for_changes().await;
        theirs.load_and_watch_for_changes().await;

        let source = JoinedPeerSource::new(vec![own.peer_source(), theirs.peer_source()]);
        let mut watched = own.watched();
        watched.extend(theirs.watched());

        let group = Arc::new(
            PeerGroup::new(
                contact_pair_group_id(
                    &self.config.group_prefix,
                    &self.owner.hash(),
                    &contact_hash,
                ),
                own.peer_for_device(&self.local_device),
                Arc::new(source),
                self.mesh.clone(),
            )
            .with_watched(watched),
        );
        group.add_sync_target(Arc::new(own)).await?;
        group.add_sync_target(Arc::new(theirs)).await?;
        Ok(group)
    }

    async fn teardown_contact(self: Arc<Self>, key: ObjectHash) -> HomeResult<()> {
        self.teardown(key, GroupKind::ContactPair).await
    }

    async fn provision_invite(self: Arc<Self>, token: InviteToken, role: Role) -> HomeResult<()> {
        let key = token.hash();
        let kind = match role {
            Role::Sender => GroupKind::InviteSender,
            Role::Receiver => GroupKind::InviteReceiver,
        };
        let Some(generation) = self.reserve(&key, kind) else {
            debug!(token = %key, ?role, "invite already provisioned");
            return Ok(());
        };
        let built = self.build_invite_group(&token, role).await;
        self.install(key, kind, generation, built).await
    }

    async fn build_invite_group(&self, token: &InviteToken, role: Role) -> HomeResult<Arc<PeerGroup>> {
        let fallback: Arc<dyn PeerSource> = Arc::new(InviteReceiverSource::new(token.clone()));
        let id = invite_group_id(&self.config.group_prefix, &token.hash());

        let group = match role {
            Role::Sender => {
                let own = self.own_account()?;
                own.load_and_watch_for_changes().await;
                let source = JoinedPeerSource::new(vec![own.peer_source(), fallback]);
                PeerGroup::new(
                    id,
                    own.peer_for_device(&self.local_device),
                    Arc::new(source),
                    self.mesh.clone(),
                )
                .with_watched(own.watched())
            }
            Role::Receiver => {
                let senders: Arc<dyn PeerSource> = Arc::new(InviteSenderSource::new(token.clone()));
                let source = JoinedPeerSource::new(vec![senders, fallback]);
                PeerGroup::new(
                    id,
                    token.receiver_peer(&self.owner.hash())?,
                    Arc::new(source),
                    self.mesh.clone(),
                )
            }
        };

        let group = Arc::new(group);
        group
            .add_sync_target(Arc::new(self.sender_slot(token)?.object_ref()))
            .await?;
        group
            .add_sync_target(Arc::new(self.reply_slot(token)?.object_ref()))
            .await?;
        Ok(group)
    }

    async fn teardown_invite(self: Arc<Self>, key: ObjectHash, role: Role) -> HomeResult<()> {
        let kind = match role {
            Role::Sender => GroupKind::InviteSender,
            Role::Receiver => GroupKind::InviteReceiver,
        };
        self.teardown(key, kind).await
    }

    async fn teardown(&self, key: ObjectHash, kind: GroupKind) -> HomeResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.still_wanted(&key, kind) {
            debug!(%key, ?kind, "element re-added, keeping group");
            return Ok(());
        }

        let slot = self.slots(kind).lock().remove(&key);
        match slot {
            Some(Slot::Ready(group)) => {
                self.syncs.remove_module_sync(group.id()).await?;
                group.deinit().await?;
                info!(%key, group_id = %group.id(), "peer group removed");
                self.emit(HomeEvent::GroupRemoved {
                    group_id: group.id().to_string(),
                });
            }
            Some(Slot::Provisioning(_)) => {
                debug!(%key, ?kind, "removed while provisioning");
            }
            None => {
                debug!(%key, ?kind, "nothing to tear down");
            }
        }
        Ok(())
    }
}

/// Run `task` on the current runtime and track it for [`Contacts::settle`].
fn spawn_handler<F, Fut>(weak: &Weak<Inner>, task: F)
where
    F: FnOnce(Arc<Inner>) -> Fut,
    Fut: std::future::Future<Output = HomeResult<()>> + Send + 'static,
{
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("set changed outside a tokio runtime; event dropped");
        return;
    };

    let fut = task(inner.clone());
    let mut tasks = inner.tasks.lock();
    reap(&mut tasks);
    tasks.spawn_on(
        async move {
            if let Err(e) = fut.await {
                warn!(error = %e, "orchestrator handler failed");
            }
        },
        &runtime,
    );
}

/// Drop finished tasks from the set.
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            warn!(error = %e, "orchestrator task failed");
        }
    }
}

impl std::fmt::Debug for Contacts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contacts")
            .field("owner", &self.inner.owner.hash())
            .field("pending_tasks", &self.pending_tasks())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MemoryMesh;
    use crate::storage::MemoryStore;

    struct Node {
        cloud: DeviceCloud,
        contacts: Contacts,
    }

    async fn node(replica: &Arc<Replica>, mesh: &Arc<MemoryMesh>, name: &str) -> Node {
        let store = Arc::new(MemoryStore::new());
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
        let contacts = Contacts::init(&cloud, replica.clone(), store, mesh.clone())
            .await
            .unwrap();
        Node { cloud, contacts }
    }

    #[tokio::test]
    async fn test_init_requires_ready_cloud() {
        let replica = Arc::new(Replica::new());
        let mesh = Arc::new(MemoryMesh::new());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let cloud = DeviceCloud::new(
            ObjectHash::from("o"),
            ObjectHash::from("d"),
            HomeConfig::default(),
            store.clone(),
            mesh.clone(),
            replica.clone(),
        );
        let result = Contacts::init(&cloud, replica, store, mesh).await;
        assert!(matches!(result, Err(HomeError::Uninitialized(_))));
    }

    #[tokio::test]
    async fn test_address_book_shared_with_own_devices() {
        let replica = Arc::new(Replica::new());
        let mesh = Arc::new(MemoryMesh::new());
        let a = node(&replica, &mesh, "a").await;

        let targets = a.cloud.peer_group().unwrap().sync_target_ids().await;
        assert!(targets.contains(&AddressBook::id_for(&a.contacts.owner().hash())));
    }

    #[tokio::test]
    async fn test_contact_lifecycle() {
        let replica = Arc::new(Replica::new());
        let mesh = Arc::new(MemoryMesh::new());
        let a = node(&replica, &mesh, "a").await;
        let b = Identity::generate(Some("b"));

        a.contacts.add_contact(b.clone()).await.unwrap();
        a.contacts.add_contact(b.clone()).await.unwrap();
        a.contacts.settle().await;

        let group_id = contact_pair_group_id("hhs-home", &a.contacts.owner().hash(), &b.hash());
        assert_eq!(a.contacts.contact_group_ids(), vec![group_id.clone()]);
        assert!(!mesh.is_member(&group_id));

        a.contacts.start().await.unwrap();
        assert!(mesh.is_member(&group_id));
        assert_eq!(mesh.synced_objects(&group_id).len(), 4);

        assert!(a.contacts.remove_contact(&b.hash()));
        a.contacts.settle().await;
        assert!(a.contacts.contact_group_ids().is_empty());
        assert!(!mesh.is_member(&group_id));
    }

    #[tokio::test]
    async fn test_finished_tasks_are_not_held() {
        let replica = Arc::new(Replica::new());
        let mesh = Arc::new(MemoryMesh::new());
        let a = node(&replica, &mesh, "a").await;
        let b = Identity::generate(Some("b"));

        let mut most_held = 0;
        for _ in 0..300 {
            a.contacts.add_contact(b.clone()).await.unwrap();
            a.contacts.remove_contact(&b.hash());
            tokio::task::yield_now().await;
            most_held = most_held.max(a.contacts.pending_tasks());
        }
        assert!(most_held < 32, "held {} handler tasks", most_held);

        a.contacts.settle().await;
        assert_eq!(a.contacts.pending_tasks(), 0);
        assert!(a.contacts.contact_group_ids().is_empty());
    }

    #[tokio::test]
    async fn test_stop_covers_groups_added_after_start() {
        let replica = Arc::new(Replica::new());
        let mesh = Arc::new(MemoryMesh::new());
        let a = node(&replica, &mesh, "a").await;
        a.contacts.start().await.unwrap();
        assert!(a.contacts.is_started().await);

        let b = Identity::generate(Some("b"));
        a.contacts.add_contact(b.clone()).await.unwrap();
        a.contacts.settle().await;

        let group_id = contact_pair_group_id("hhs-home", &a.contacts.owner().hash(), &b.hash());
        assert_eq!(a.contacts.module_group_ids().await, vec![group_id.clone()]);
        assert!(mesh.is_member(&group_id));

        a.contacts.stop().await.unwrap();
        assert!(!a.contacts.is_started().await);
        assert!(!mesh.is_member(&group_id));

        a.contacts.remove_contact(&b.hash());
        a.contacts.settle().await;
        assert!(a.contacts.module_group_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_sync_with_unprovisioned_contact_fails() {
        let replica = Arc::new(Replica::new());
        let mesh = Arc::new(MemoryMesh::new());
        let a = node(&replica, &mesh, "a").await;

        let result = a
            .contacts
            .sync_with_contact(&ObjectHash::from("stranger"), Arc::new(ObjectRef::new("x")))
            .await;
        assert!(matches!(result, Err(HomeError::Uninitialized(_))));
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let replica = Arc::new(Replica::new());
        let mesh = Arc::new(MemoryMesh::new());
        let a = node(&replica, &mesh, "a").await;
        let mut events = a.contacts.subscribe();
        a.contacts.start().await.unwrap();

        let b = Identity::generate(Some("b"));
        a.contacts.add_contact(b.clone()).await.unwrap();
        a.contacts.settle().await;

        let group_id = contact_pair_group_id("hhs-home", &a.contacts.owner().hash(), &b.hash());
        assert_eq!(
            events.recv().await.unwrap(),
            HomeEvent::GroupProvisioned {
                group_id: group_id.clone(),
                kind: GroupKind::ContactPair,
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            HomeEvent::GroupConnected { group_id }
        );
    }
}
