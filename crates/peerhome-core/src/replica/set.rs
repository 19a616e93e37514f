//! Replicated set views

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{Element, WatchedCollection};
use crate::group::ObjectRef;
use crate::types::ObjectHash;

/// Callback invoked with an added or deleted element
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Converged membership shared by every view of one set
pub(crate) struct SetCore<T: Element> {
    members: RwLock<BTreeMap<ObjectHash, T>>,
    views: Mutex<Vec<Weak<ViewState<T>>>>,
}

impl<T: Element> SetCore<T> {
    pub(crate) fn new() -> Self {
        Self {
            members: RwLock::new(BTreeMap::new()),
            views: Mutex::new(Vec::new()),
        }
    }

    fn live_views(&self) -> Vec<Arc<ViewState<T>>> {
        let mut views = self.views.lock();
        views.retain(|v| v.strong_count() > 0);
        views.iter().filter_map(Weak::upgrade).collect()
    }
}

struct ViewState<T> {
    watching: AtomicBool,
    on_addition: RwLock<Vec<Handler<T>>>,
    on_deletion: RwLock<Vec<Handler<T>>>,
}

enum Change {
    Added,
    Deleted,
}

/// A view over a replicated set of `T`.
///
/// Cloning a view shares its handlers and watching flag. Open a separate
/// view through [`Replica::set`](super::Replica::set) for independent ones.
///
/// Handlers run on the thread that performed the change, after every
/// internal lock has been released, and only while the view is watching.
pub struct ReplicatedSet<T: Element> {
    id: Arc<str>,
    core: Arc<SetCore<T>>,
    view: Arc<ViewState<T>>,
}

impl<T: Element> Clone for ReplicatedSet<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            core: self.core.clone(),
            view: self.view.clone(),
        }
    }
}

impl<T: Element> std::fmt::Debug for ReplicatedSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedSet")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("watching", &self.is_watching())
            .finish()
    }
}

impl<T: Element> ReplicatedSet<T> {
    pub(crate) fn attach(id: &str, core: Arc<SetCore<T>>) -> Self {
        let view = Arc::new(ViewState {
            watching: AtomicBool::new(false),
            on_addition: RwLock::new(Vec::new()),
            on_deletion: RwLock::new(Vec::new()),
        });
        core.views.lock().push(Arc::downgrade(&view));

        Self {
            id: Arc::from(id),
            core,
            view,
        }
    }

    /// Set id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reference used when registering this set with a peer group
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.id.as_ref())
    }

    /// Insert an element. Returns `false` if it was already present.
    pub fn add(&self, element: T) -> bool {
        let hash = element.element_hash();
        {
            let mut members = self.core.members.write();
            if members.contains_key(&hash) {
                return false;
            }
            members.insert(hash.clone(), element.clone());
        }
        trace!(set = %self.id, %hash, "element added");
        self.notify(Change::Added, &element);
        true
    }

    /// Remove an element by hash, returning it if it was present.
    pub fn delete(&self, hash: &ObjectHash) -> Option<T> {
        let removed = self.core.members.write().remove(hash)?;
        trace!(set = %self.id, %hash, "element deleted");
        self.notify(Change::Deleted, &removed);
        Some(removed)
    }

    /// Whether an element with this hash is present
    pub fn has(&self, hash: &ObjectHash) -> bool {
        self.core.members.read().contains_key(hash)
    }

    /// Look up an element by hash
    pub fn get(&self, hash: &ObjectHash) -> Option<T> {
        self.core.members.read().get(hash).cloned()
    }

    /// Snapshot of all members, ordered by hash
    pub fn values(&self) -> Vec<T> {
        self.core.members.read().values().cloned().collect()
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.core.members.read().len()
    }

    /// Whether the set has no members
    pub fn is_empty(&self) -> bool {
        self.core.members.read().is_empty()
    }

    /// Register a handler for additions seen by this view.
    pub fn on_addition(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.view.on_addition.write().push(Arc::new(handler));
    }

    /// Register a handler for deletions seen by this view.
    pub fn on_deletion(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.view.on_deletion.write().push(Arc::new(handler));
    }

    /// Start delivering changes to this view's handlers.
    ///
    /// Current members are replayed to the addition handlers so a watcher
    /// that registers late still sees every element once. Calling this on
    /// a view that is already watching does nothing.
    pub async fn load_and_watch_for_changes(&self) {
        // initial load is where a persistent backend would suspend
        tokio::task::yield_now().await;

        if self.view.watching.swap(true, Ordering::SeqCst) {
            return;
        }

        let current = self.values();
        let handlers = self.view.on_addition.read().clone();
        trace!(set = %self.id, members = current.len(), "watching for changes");
        for element in &current {
            for handler in &handlers {
                handler(element);
            }
        }
    }

    /// Whether this view is delivering changes
    pub fn is_watching(&self) -> bool {
        self.view.watching.load(Ordering::SeqCst)
    }

    fn notify(&self, change: Change, element: &T) {
        for view in self.core.live_views() {
            if !view.watching.load(Ordering::SeqCst) {
                continue;
            }
            let handlers = match change {
                Change::Added => view.on_addition.read().clone(),
                Change::Deleted => view.on_deletion.read().clone(),
            };
            for handler in &handlers {
                handler(element);
            }
        }
    }
}

impl<T: Element> WatchedCollection for ReplicatedSet<T> {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop_watching(&self) {
        if self.view.watching.swap(false, Ordering::SeqCst) {
            trace!(set = %self.id, "stopped watching");
        }
    }
}
