//! Single-value replicated slots

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::Element;
use crate::group::ObjectRef;

pub(crate) struct RefCore<T> {
    value: RwLock<Option<T>>,
}

impl<T> Default for RefCore<T> {
    fn default() -> Self {
        Self {
            value: RwLock::new(None),
        }
    }
}

/// A replicated slot holding at most one value. Last write wins.
pub struct ReplicatedRef<T: Element> {
    id: Arc<str>,
    core: Arc<RefCore<T>>,
}

impl<T: Element> Clone for ReplicatedRef<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            core: self.core.clone(),
        }
    }
}

impl<T: Element> ReplicatedRef<T> {
    pub(crate) fn attach(id: &str, core: Arc<RefCore<T>>) -> Self {
        Self {
            id: Arc::from(id),
            core,
        }
    }

    /// Slot id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Reference used when registering this slot with a peer group
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.id.as_ref())
    }

    /// Replace the current value
    pub fn set_value(&self, value: T) {
        trace!(slot = %self.id, hash = %value.element_hash(), "slot written");
        *self.core.value.write() = Some(value);
    }

    /// Current value, if any
    pub fn value(&self) -> Option<T> {
        self.core.value.read().clone()
    }

    /// Empty the slot, returning the previous value
    pub fn clear(&self) -> Option<T> {
        self.core.value.write().take()
    }
}
