//! The mesh transport, seen from the orchestration layer
//!
//! Real network I/O, NAT traversal and signaling live behind the [`Mesh`]
//! trait. Peer groups only ever join, leave, and register objects to sync.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HomeResult;
use crate::group::ObjectRef;
use crate::peers::PeerSource;
use crate::types::PeerInfo;

pub use memory::MemoryMesh;

/// Everything the mesh needs to run a peer group
#[derive(Clone)]
pub struct PeerGroupInfo {
    pub id: String,
    pub local_peer: PeerInfo,
    pub peer_source: Arc<dyn PeerSource>,
}

impl std::fmt::Debug for PeerGroupInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerGroupInfo")
            .field("id", &self.id)
            .field("local_peer", &self.local_peer)
            .finish_non_exhaustive()
    }
}

/// Mesh collaborator interface
#[async_trait]
pub trait Mesh: Send + Sync {
    /// Start participating in a group.
    async fn join_peer_group(&self, info: PeerGroupInfo) -> HomeResult<()>;

    /// Stop participating in a group and drop every sync registered for it.
    ///
    /// Leaving a group that was never joined, or leaving twice, is a no-op.
    async fn leave_peer_group(&self, group_id: &str) -> HomeResult<()>;

    /// Keep `object` consistent with the group's members.
    async fn sync_object_with_peer_group(
        &self,
        group_id: &str,
        object: ObjectRef,
        recursive: bool,
    ) -> HomeResult<()>;

    /// Batch form of [`sync_object_with_peer_group`](Self::sync_object_with_peer_group)
    /// (always recursive).
    async fn sync_many_objects_with_peer_group(
        &self,
        group_id: &str,
        objects: Vec<ObjectRef>,
    ) -> HomeResult<()>;
}
