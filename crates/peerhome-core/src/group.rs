//! Peer groups: named units of mesh membership
//!
//! A [`PeerGroup`] bundles a deterministic id, the local peer, and a peer
//! source. Connecting registers it with the mesh; sync targets attached to
//! it are kept consistent with whoever the mesh finds through the source.
//!
//! ## Lifecycle
//!
//! ```text
//!            connect()              disconnect()
//!   Idle ───────────────► Connected ─────────────► Idle
//!     │                       │
//!     └──── deinit() ─────────┴──── deinit() ────► Closed
//! ```
//!
//! `connect` and `add_sync_target` are idempotent. `deinit` leaves the
//! mesh if needed, stops watching the collections that fed the peer
//! source, and is safe on a group that never connected.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::HomeResult;
use crate::mesh::{Mesh, PeerGroupInfo};
use crate::peers::PeerSource;
use crate::replica::WatchedCollection;
use crate::types::{ObjectHash, PeerInfo};

/// Id of an owner's own device group
pub fn device_group_id(prefix: &str, owner: &ObjectHash) -> String {
    format!("{}-{}-devices", prefix, owner)
}

/// Id of the group shared by two contacts.
///
/// The hashes are sorted, so both sides compute the same id.
pub fn contact_pair_group_id(prefix: &str, a: &ObjectHash, b: &ObjectHash) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{}-{}-{}-contact-pair", prefix, first, second)
}

/// Id of the group for a pending invite
pub fn invite_group_id(prefix: &str, token_hash: &ObjectHash) -> String {
    format!("{}-{}", prefix, token_hash)
}

/// Reference to a replicated object, by id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef(String);

impl ObjectRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something to keep consistent across a group's members.
pub trait SyncTarget: Send + Sync {
    /// Stable identity; attaching two targets with the same id is a no-op
    fn target_id(&self) -> String;

    /// Objects the mesh should synchronize for this target
    fn root_objects(&self) -> Vec<ObjectRef>;
}

/// A single replicated object as a sync target
impl SyncTarget for ObjectRef {
    fn target_id(&self) -> String {
        self.0.clone()
    }

    fn root_objects(&self) -> Vec<ObjectRef> {
        vec![self.clone()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Idle,
    Connected,
    Closed,
}

struct GroupInner {
    state: GroupState,
    targets: BTreeMap<String, Arc<dyn SyncTarget>>,
}

/// A named, idempotent unit of mesh membership
pub struct PeerGroup {
    id: String,
    local_peer: PeerInfo,
    peer_source: Arc<dyn PeerSource>,
    mesh: Arc<dyn Mesh>,
    watched: Vec<Arc<dyn WatchedCollection>>,
    inner: Mutex<GroupInner>,
}

impl std::fmt::Debug for PeerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerGroup")
            .field("id", &self.id)
            .field("local_peer", &self.local_peer)
            .finish_non_exhaustive()
    }
}

impl PeerGroup {
    pub fn new(
        id: impl Into<String>,
        local_peer: PeerInfo,
        peer_source: Arc<dyn PeerSource>,
        mesh: Arc<dyn Mesh>,
    ) -> Self {
        Self {
            id: id.into(),
            local_peer,
            peer_source,
            mesh,
            watched: Vec::new(),
            inner: Mutex::new(GroupInner {
                state: GroupState::Idle,
                targets: BTreeMap::new(),
            }),
        }
    }

    /// Collections that feed the peer source; released on [`deinit`](Self::deinit).
    pub fn with_watched(mut self, watched: Vec<Arc<dyn WatchedCollection>>) -> Self {
        self.watched = watched;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.local_peer
    }

    pub fn peer_source(&self) -> Arc<dyn PeerSource> {
        self.peer_source.clone()
    }

    /// What the mesh needs to join this group
    pub fn info(&self) -> PeerGroupInfo {
        PeerGroupInfo {
            id: self.id.clone(),
            local_peer: self.local_peer.clone(),
            peer_source: self.peer_source.clone(),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.state == GroupState::Connected
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.state == GroupState::Closed
    }

    /// Ids of attached sync targets, sorted
    pub async fn sync_target_ids(&self) -> Vec<String> {
        self.inner.lock().await.targets.keys().cloned().collect()
    }

    /// Join the mesh and start syncing every attached target.
    ///
    /// Does nothing if already connected or closed.
    pub async fn connect(&self) -> HomeResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            GroupState::Connected => {
                debug!(group_id = %self.id, "already connected");
                return Ok(());
            }
            GroupState::Closed => {
                debug!(group_id = %self.id, "connect on closed group ignored");
                return Ok(());
            }
            GroupState::Idle => {}
        }

        self.mesh.join_peer_group(self.info()).await?;
        inner.state = GroupState::Connected;
        for target in inner.targets.values() {
            self.sync_target(target.as_ref()).await?;
        }

        info!(group_id = %self.id, targets = inner.targets.len(), "peer group connected");
        Ok(())
    }

    /// Attach a sync target. Returns `false` if one with the same id is
    /// already attached.
    ///
    /// A connected group starts syncing the target right away; otherwise
    /// syncing waits for [`connect`](Self::connect).
    pub async fn add_sync_target(&self, target: Arc<dyn SyncTarget>) -> HomeResult<bool> {
        let mut inner = self.inner.lock().await;
        let target_id = target.target_id();
        if inner.targets.contains_key(&target_id) {
            return Ok(false);
        }

        if inner.state == GroupState::Connected {
            self.sync_target(target.as_ref()).await?;
        }
        debug!(group_id = %self.id, %target_id, "sync target attached");
        inner.targets.insert(target_id, target);
        Ok(true)
    }

    /// Leave the mesh, keeping targets for a later reconnect.
    pub async fn disconnect(&self) -> HomeResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == GroupState::Connected {
            self.mesh.leave_peer_group(&self.id).await?;
            inner.state = GroupState::Idle;
            info!(group_id = %self.id, "peer group disconnected");
        }
        Ok(())
    }

    /// Tear the group down for good.
    pub async fn deinit(&self) -> HomeResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == GroupState::Closed {
            return Ok(());
        }

        let was_connected = inner.state == GroupState::Connected;
        inner.state = GroupState::Closed;
        inner.targets.clear();
        for collection in &self.watched {
            collection.stop_watching();
        }

        if was_connected {
            self.mesh.leave_peer_group(&self.id).await?;
        }
        info!(group_id = %self.id, was_connected, "peer group closed");
        Ok(())
    }

    async fn sync_target(&self, target: &dyn SyncTarget) -> HomeResult<()> {
        let mut roots = target.root_objects();
        match roots.len() {
            0 => Ok(()),
            1 => {
                let root = roots.remove(0);
                self.mesh
                    .sync_object_with_peer_group(&self.id, root, true)
                    .await
            }
            _ => {
                self.mesh
                    .sync_many_objects_with_peer_group(&self.id, roots)
                    .await
            }
        }
    }
}
