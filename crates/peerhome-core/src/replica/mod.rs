//! Local views over replicated collections
//!
//! The CRDT layer that merges replicated state between devices lives
//! outside this crate. What the orchestration code needs from it is small:
//! typed sets and single-value slots addressed by id, with addition and
//! deletion notifications.
//!
//! A [`Replica`] holds the converged state of every collection. Each call
//! to [`Replica::set`] returns a fresh *view* over the shared state: views
//! see the same members but carry their own handlers and their own
//! watching flag, so one peer group that stops watching does not silence
//! another.
//!
//! ```text
//! Replica
//!   └── "contacts-for-<owner>/contacts" ──► SetCore<Identity>
//!                                             ├── view (Contacts orchestrator)
//!                                             └── view (device cloud sync target)
//! ```

pub mod reference;
pub mod set;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{HomeError, HomeResult};
use crate::invite::{Invite, InviteReply, InviteToken};
use crate::types::{Device, Identity, LinkupServer, ObjectHash};

pub use reference::ReplicatedRef;
pub use set::ReplicatedSet;

/// Something that can live in a replicated collection.
///
/// Members are keyed by their content hash.
pub trait Element: Clone + Send + Sync + 'static {
    fn element_hash(&self) -> ObjectHash;
}

impl Element for Identity {
    fn element_hash(&self) -> ObjectHash {
        self.hash()
    }
}

impl Element for Device {
    fn element_hash(&self) -> ObjectHash {
        self.hash()
    }
}

impl Element for LinkupServer {
    fn element_hash(&self) -> ObjectHash {
        self.hash()
    }
}

impl Element for InviteToken {
    fn element_hash(&self) -> ObjectHash {
        self.hash()
    }
}

impl Element for Invite {
    fn element_hash(&self) -> ObjectHash {
        self.hash()
    }
}

impl Element for InviteReply {
    fn element_hash(&self) -> ObjectHash {
        self.hash()
    }
}

/// A collection whose change notifications can be switched off.
pub trait WatchedCollection: Send + Sync {
    /// Collection id
    fn id(&self) -> &str;
    /// Stop delivering change notifications to this view's handlers.
    fn stop_watching(&self);
}

/// Registry of replicated collections, keyed by id.
#[derive(Default)]
pub struct Replica {
    cores: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Replica {
    /// Create an empty replica
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new view over the set `id`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `HomeError::ReplicaTypeMismatch` if `id` already names a
    /// collection of a different kind or element type.
    pub fn set<T: Element>(&self, id: &str) -> HomeResult<ReplicatedSet<T>> {
        let core = self.core::<set::SetCore<T>>(id, set::SetCore::new)?;
        Ok(ReplicatedSet::attach(id, core))
    }

    /// Open the single-value slot `id`, creating it if needed.
    pub fn reference<T: Element>(&self, id: &str) -> HomeResult<ReplicatedRef<T>> {
        let core = self.core::<reference::RefCore<T>>(id, reference::RefCore::default)?;
        Ok(ReplicatedRef::attach(id, core))
    }

    /// Whether a collection with this id exists
    pub fn contains(&self, id: &str) -> bool {
        self.cores.lock().contains_key(id)
    }

    /// Ids of all known collections, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cores.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn core<C: Send + Sync + 'static>(
        &self,
        id: &str,
        create: impl FnOnce() -> C,
    ) -> HomeResult<Arc<C>> {
        let any = self
            .cores
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(create()))
            .clone();

        any.downcast::<C>().map_err(|_| {
            HomeError::ReplicaTypeMismatch(format!(
                "{} is already open as a different collection type",
                id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_share_members() {
        let replica = Replica::new();
        let a = replica.set::<Identity>("people").unwrap();
        let b = replica.set::<Identity>("people").unwrap();

        let id = Identity::new([1u8; 32], None);
        a.add(id.clone());
        assert!(b.has(&id.hash()));
        assert!(replica.contains("people"));
        assert_eq!(replica.ids(), vec!["people".to_string()]);
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let replica = Replica::new();
        replica.set::<Identity>("x").unwrap();

        assert!(matches!(
            replica.set::<Device>("x"),
            Err(HomeError::ReplicaTypeMismatch(_))
        ));
        assert!(matches!(
            replica.reference::<Identity>("x"),
            Err(HomeError::ReplicaTypeMismatch(_))
        ));
    }
}
