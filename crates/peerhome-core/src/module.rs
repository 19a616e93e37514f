//! Start/stop aggregation for feature modules
//!
//! A feature module (the device cloud, the contacts orchestrator) owns a
//! handful of peer groups that should all come up together when the module
//! starts and go down together when it stops. [`ModuleSyncs`] holds those
//! groups and applies one lifecycle rule to all of them:
//! - groups added while started connect immediately
//! - groups removed while started disconnect immediately
//! - start and stop are idempotent

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::HomeResult;
use crate::group::PeerGroup;

/// A feature with a start/stop lifecycle
#[async_trait]
pub trait Module: Send + Sync {
    /// Bring every peer group of the module onto the mesh.
    async fn start(&self) -> HomeResult<()>;

    /// Take every peer group of the module off the mesh.
    async fn stop(&self) -> HomeResult<()>;
}

struct SyncsInner {
    active: bool,
    groups: Vec<Arc<PeerGroup>>,
}

/// The peer groups of one module under a shared start/stop switch
pub struct ModuleSyncs {
    name: String,
    inner: Mutex<SyncsInner>,
}

impl ModuleSyncs {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(SyncsInner {
                active: false,
                groups: Vec::new(),
            }),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.active
    }

    /// Ids of the held groups, in insertion order
    pub async fn group_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.groups.iter().map(|g| g.id().to_string()).collect()
    }

    /// Snapshot of the held groups, in insertion order
    pub async fn groups(&self) -> Vec<Arc<PeerGroup>> {
        self.inner.lock().await.groups.clone()
    }

    /// Connect every group. Does nothing if already active.
    pub async fn start(&self) -> HomeResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.active {
            return Ok(());
        }
        inner.active = true;
        for group in &inner.groups {
            group.connect().await?;
        }
        info!(module = %self.name, groups = inner.groups.len(), "module started");
        Ok(())
    }

    /// Disconnect every group. Does nothing if not active.
    pub async fn stop(&self) -> HomeResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.active {
            return Ok(());
        }
        inner.active = false;
        for group in &inner.groups {
            group.disconnect().await?;
        }
        info!(module = %self.name, "module stopped");
        Ok(())
    }

    /// Hold a group, connecting it now if the module is active.
    ///
    /// A group with the same id is only held once.
    pub async fn add_module_sync(&self, group: Arc<PeerGroup>) -> HomeResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.groups.iter().any(|g| g.id() == group.id()) {
            debug!(module = %self.name, group_id = %group.id(), "group already held");
            return Ok(());
        }
        if inner.active {
            group.connect().await?;
        }
        inner.groups.push(group);
        Ok(())
    }

    /// Release a group by id, disconnecting it if the module is active.
    ///
    /// Returns the group if it was held.
    pub async fn remove_module_sync(&self, group_id: &str) -> HomeResult<Option<Arc<PeerGroup>>> {
        let mut inner = self.inner.lock().await;
        let Some(pos) = inner.groups.iter().position(|g| g.id() == group_id) else {
            return Ok(None);
        };
        let group = inner.groups.remove(pos);
        if inner.active {
            group.disconnect().await?;
        }
        Ok(Some(group))
    }
}
