//! Path-keyed subscription registry
//!
//! Callbacks register against a literal dot-path and are delivered in
//! registration order. Delivery itself is driven by the state handle (it owns
//! the live re-reads for ancestor paths); this module is only the table.
//!
//! Entries are cloned out into a snapshot before each delivery pass, so a
//! callback may subscribe or unsubscribe mid-delivery without corrupting the
//! iteration.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::state::StateInner;
use crate::value::Value;

/// Callback type for path subscribers
pub(crate) type SubscriberFn = Rc<dyn Fn(&Value)>;

struct Entry {
    id: u64,
    callback: SubscriberFn,
}

/// Table of subscribers keyed by exact path
pub(crate) struct SubscriptionRegistry {
    paths: FxHashMap<String, SmallVec<[Entry; 4]>>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            paths: FxHashMap::default(),
            next_id: 0,
        }
    }

    /// Register a callback at a path; returns its entry id
    pub fn insert(&mut self, path: &str, callback: SubscriberFn) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.paths
            .entry(path.to_string())
            .or_default()
            .push(Entry { id, callback });
        id
    }

    /// Remove one entry; unknown ids are ignored
    pub fn remove(&mut self, path: &str, id: u64) {
        if let Some(entries) = self.paths.get_mut(path) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                self.paths.remove(path);
            }
        }
    }

    pub fn has(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    /// Defensive copy of a path's callbacks, in registration order
    pub fn snapshot(&self, path: &str) -> SmallVec<[SubscriberFn; 4]> {
        self.paths
            .get(path)
            .map(|entries| entries.iter().map(|e| e.callback.clone()).collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.paths.clear();
    }

    /// Total registered callbacks across all paths
    pub fn len(&self) -> usize {
        self.paths.values().map(|v| v.len()).sum()
    }
}

/// Disposer for one subscription
///
/// Dropping the handle does *not* unsubscribe; subscriptions persist until
/// [`dispose`](SubscriptionHandle::dispose), `unsubscribe_all`, or `destroy`.
/// Disposing more than once is a no-op.
pub struct SubscriptionHandle {
    state: Weak<StateInner>,
    path: String,
    id: u64,
    disposed: Cell<bool>,
}

impl SubscriptionHandle {
    pub(crate) fn new(state: Weak<StateInner>, path: String, id: u64) -> Self {
        Self {
            state,
            path,
            id,
            disposed: Cell::new(false),
        }
    }

    /// A handle that was never registered (subscribing on destroyed state)
    pub(crate) fn inert() -> Self {
        Self {
            state: Weak::new(),
            path: String::new(),
            id: 0,
            disposed: Cell::new(true),
        }
    }

    /// Remove the subscription; idempotent
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        if let Some(inner) = self.state.upgrade() {
            inner.registry.borrow_mut().remove(&self.path, self.id);
        }
    }

    /// The path this subscription was registered at
    pub fn path(&self) -> &str {
        &self.path
    }
}
