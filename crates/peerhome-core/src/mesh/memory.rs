//! In-process mesh
//!
//! Records which groups are joined and which objects are synced with each,
//! without moving any bytes. Tests and the demo use it to observe what the
//! orchestration layer asked of the transport.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Mesh, PeerGroupInfo};
use crate::error::{HomeError, HomeResult};
use crate::group::ObjectRef;
use crate::peers::PeerSource;
use crate::types::PeerInfo;

struct Membership {
    info: PeerGroupInfo,
    synced: BTreeSet<ObjectRef>,
}

#[derive(Default)]
struct MeshState {
    groups: HashMap<String, Membership>,
    joins: HashMap<String, usize>,
}

/// A [`Mesh`] that keeps everything in memory
#[derive(Default)]
pub struct MemoryMesh {
    state: Mutex<MeshState>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `group_id` is currently joined
    pub fn is_member(&self, group_id: &str) -> bool {
        self.state.lock().groups.contains_key(group_id)
    }

    /// How many times `group_id` has been joined over the mesh's lifetime
    pub fn join_count(&self, group_id: &str) -> usize {
        self.state.lock().joins.get(group_id).copied().unwrap_or(0)
    }

    /// Objects currently synced with `group_id`, sorted
    pub fn synced_objects(&self, group_id: &str) -> Vec<ObjectRef> {
        self.state
            .lock()
            .groups
            .get(group_id)
            .map(|m| m.synced.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of every joined group, sorted
    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Local peer a joined group was registered with
    pub fn local_peer(&self, group_id: &str) -> Option<PeerInfo> {
        self.state
            .lock()
            .groups
            .get(group_id)
            .map(|m| m.info.local_peer.clone())
    }

    /// Ask a joined group's peer source for up to `count` peers.
    pub async fn discover(&self, group_id: &str, count: usize) -> HomeResult<Vec<PeerInfo>> {
        let source = self.peer_source(group_id)?;
        Ok(source.get_peers(count).await)
    }

    /// Ask a joined group's peer source who is behind `endpoint`.
    pub async fn resolve(&self, group_id: &str, endpoint: &str) -> HomeResult<Option<PeerInfo>> {
        let source = self.peer_source(group_id)?;
        Ok(source.get_peer_for_endpoint(endpoint).await)
    }

    fn peer_source(&self, group_id: &str) -> HomeResult<Arc<dyn PeerSource>> {
        self.state
            .lock()
            .groups
            .get(group_id)
            .map(|m| m.info.peer_source.clone())
            .ok_or_else(|| HomeError::Mesh(format!("not a member of {}", group_id)))
    }

    fn register(
        &self,
        group_id: &str,
        objects: impl IntoIterator<Item = ObjectRef>,
    ) -> HomeResult<()> {
        let mut state = self.state.lock();
        let membership = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| HomeError::Mesh(format!("not a member of {}", group_id)))?;

        for object in objects {
            if membership.synced.insert(object.clone()) {
                debug!(%group_id, %object, "object sync registered");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Mesh for MemoryMesh {
    async fn join_peer_group(&self, info: PeerGroupInfo) -> HomeResult<()> {
        let mut state = self.state.lock();
        *state.joins.entry(info.id.clone()).or_insert(0) += 1;

        let group_id = info.id.clone();
        state.groups.entry(group_id.clone()).or_insert_with(|| Membership {
            info,
            synced: BTreeSet::new(),
        });
        info!(%group_id, "joined peer group");
        Ok(())
    }

    async fn leave_peer_group(&self, group_id: &str) -> HomeResult<()> {
        if let Some(membership) = self.state.lock().groups.remove(group_id) {
            info!(%group_id, released = membership.synced.len(), "left peer group");
        } else {
            debug!(%group_id, "leave for unknown group ignored");
        }
        Ok(())
    }

    async fn sync_object_with_peer_group(
        &self,
        group_id: &str,
        object: ObjectRef,
        _recursive: bool,
    ) -> HomeResult<()> {
        self.register(group_id, [object])
    }

    async fn sync_many_objects_with_peer_group(
        &self,
        group_id: &str,
        objects: Vec<ObjectRef>,
    ) -> HomeResult<()> {
        self.register(group_id, objects)
    }
}
