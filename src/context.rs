//! Call-scoped storage of request descriptors.
//!
//! Every in-flight call gets its own [`CallId`] and an entry in the [`CallContextStore`]. The
//! entry is owned by a [`CallContextGuard`] which travels with the per-call task, so the entry is
//! removed whenever the call ends: normal completion, a call error, a dropped response stream or
//! an aborted task.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;
use uuid::Uuid;

use crate::descriptor::RequestDescriptor;

/// Identity of one in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

impl CallId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

type Contexts = HashMap<CallId, Arc<RequestDescriptor>>;

/// Shared map from call identity to the descriptor decoded for that call.
#[derive(Debug, Clone, Default)]
pub struct CallContextStore {
    contexts: Arc<RwLock<Contexts>>,
}

impl CallContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `descriptor` under a fresh call id. The entry lives as long as the returned guard.
    pub fn open(&self, descriptor: RequestDescriptor) -> CallContextGuard {
        let id = CallId::new();
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(descriptor));
        debug!(call_id = %id, "Opened call context");
        CallContextGuard {
            id,
            store: self.clone(),
        }
    }

    /// The descriptor of call `id`, if the call is still in flight.
    pub fn get(&self, id: &CallId) -> Option<Arc<RequestDescriptor>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn remove(&self, id: &CallId) {
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        debug!(call_id = %id, "Closed call context");
    }

    /// Number of calls currently in flight.
    pub fn len(&self) -> usize {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps the context of one call alive. Dropping it removes the entry from the store.
#[derive(Debug)]
pub struct CallContextGuard {
    id: CallId,
    store: CallContextStore,
}

impl CallContextGuard {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn descriptor(&self) -> Option<Arc<RequestDescriptor>> {
        self.store.get(&self.id)
    }
}

impl Drop for CallContextGuard {
    fn drop(&mut self) {
        self.store.remove(&self.id);
    }
}
