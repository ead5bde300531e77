//! State handle and views
//!
//! [`StateHandle`] ties the pieces together: the node arena, the subscription
//! registry, the computed-property table, and the deferred recompute queue.
//! One handle owns one engine instance - there is no process-wide registry;
//! the hosting application creates a handle and passes it to collaborators.
//!
//! All access is single-threaded and cooperative. Interior mutability is
//! `RefCell`/`Cell`; no borrow is held across a user callback, so callbacks
//! may freely read, write, subscribe, and unsubscribe re-entrantly.
//!
//! # Views
//!
//! [`StateRef`] is the explicit-accessor rendition of transparent property
//! interception: reading a composite key yields a fresh sub-view for the
//! extended path, scalars pass through as values, and writes route into the
//! shared arena followed by notification. Views are live aliases over the one
//! physical graph, not copies - two views of the same location observe each
//! other's writes. View identity is not stable across reads: each access
//! constructs a fresh view, and a view whose node was replaced wholesale
//! becomes inert rather than resurrecting freed state.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use rustc_hash::FxHashSet;

use crate::computed::{self, ComputedTable};
use crate::observe::{SubscriberFn, SubscriptionHandle, SubscriptionRegistry};
use crate::path;
use crate::store::{NodeArena, WriteOutcome};
use crate::value::Value;

/// Recording session for automatic dependency discovery
///
/// Passed explicitly into tracked views rather than living in ambient
/// storage; every path read through a view carrying the session lands in the
/// set.
pub(crate) type Tracker = Rc<RefCell<FxHashSet<String>>>;

/// Shared engine state behind a [`StateHandle`]
pub(crate) struct StateInner {
    pub(crate) arena: RefCell<NodeArena>,
    pub(crate) registry: RefCell<SubscriptionRegistry>,
    pub(crate) computed: RefCell<ComputedTable>,
    /// Names of computed properties awaiting a deferred recompute
    pub(crate) queue: RefCell<VecDeque<String>>,
    pub(crate) flushing: Cell<bool>,
    pub(crate) destroyed: Cell<bool>,
}

/// Counters describing a state instance
#[derive(Debug, Clone)]
pub struct StateStats {
    pub node_count: usize,
    pub subscription_count: usize,
    pub computed_count: usize,
    pub pending_recomputes: usize,
}

/// Handle to one reactive state instance (cheap to clone)
#[derive(Clone)]
pub struct StateHandle {
    inner: Rc<StateInner>,
}

impl StateHandle {
    /// Create a state instance from initial data
    pub fn new(initial: impl Into<Value>) -> Self {
        Self {
            inner: Rc::new(StateInner {
                arena: RefCell::new(NodeArena::new(initial.into())),
                registry: RefCell::new(SubscriptionRegistry::new()),
                computed: RefCell::new(ComputedTable::new()),
                queue: RefCell::new(VecDeque::new()),
                flushing: Cell::new(false),
                destroyed: Cell::new(false),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<StateInner> {
        &self.inner
    }

    /// Register a callback at an exact path
    ///
    /// The callback fires when that path changes, and when any descendant
    /// changes (with the current value of the subscribed path). Subscriptions
    /// persist until disposed, `unsubscribe_all`, or `destroy`.
    pub fn subscribe(&self, path: &str, callback: impl Fn(&Value) + 'static) -> SubscriptionHandle {
        if self.inner.destroyed.get() {
            return SubscriptionHandle::inert();
        }
        let id = self
            .inner
            .registry
            .borrow_mut()
            .insert(path, Rc::new(callback) as SubscriberFn);
        SubscriptionHandle::new(Rc::downgrade(&self.inner), path.to_string(), id)
    }

    /// Read the value at a dot-path; `None` on any missing segment
    ///
    /// Computed properties resolve through their cache, re-evaluating first if
    /// dirty.
    pub fn get_nested_value(&self, path: &str) -> Option<Value> {
        read_path(&self.inner, path, None)
    }

    /// Whether a value exists at the path
    pub fn contains(&self, path: &str) -> bool {
        self.get_nested_value(path).is_some()
    }

    /// Write a value at a dot-path
    ///
    /// Returns `true` when a change was committed and notified. Writing a
    /// structurally identical scalar, writing under a missing intermediate
    /// path, or writing after `destroy` commits nothing and returns `false`.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> bool {
        set_value(&self.inner, path, value.into())
    }

    /// Read-modify-write at a path (missing values read as `Null`)
    pub fn update(&self, path: &str, f: impl FnOnce(Value) -> Value) -> bool {
        let current = self.get_nested_value(path).unwrap_or(Value::Null);
        self.set(path, f(current))
    }

    /// View of the root of the state graph
    pub fn root(&self) -> StateRef {
        StateRef::new(self.inner.clone(), String::new(), None)
    }

    /// Materialize the whole data graph
    ///
    /// Computed properties appear once their values have been written back by
    /// a recompute pass.
    pub fn snapshot(&self) -> Value {
        if self.inner.destroyed.get() {
            return Value::Null;
        }
        self.inner.arena.borrow().snapshot_root()
    }

    /// Synchronously drain all scheduled computed recomputations
    pub fn flush_pending_recomputations(&self) {
        computed::flush(&self.inner);
    }

    /// Drop every subscription, including computed dependency links
    ///
    /// Computed properties stay defined and readable, but no longer observe
    /// their dependencies; an evaluation after this re-registers the links it
    /// still needs. Safe to call repeatedly.
    pub fn unsubscribe_all(&self) {
        self.inner.registry.borrow_mut().clear();
        self.inner.computed.borrow_mut().forget_links();
    }

    /// Tear the instance down; idempotent
    ///
    /// Subsequent reads return `None` and writes are inert no-ops (no panic,
    /// no notification).
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        self.inner.registry.borrow_mut().clear();
        self.inner.computed.borrow_mut().clear();
        self.inner.queue.borrow_mut().clear();
        self.inner.arena.borrow_mut().reset();
    }

    /// Counters for diagnostics and tests
    pub fn stats(&self) -> StateStats {
        StateStats {
            node_count: self.inner.arena.borrow().node_count(),
            subscription_count: self.inner.registry.borrow().len(),
            computed_count: self.inner.computed.borrow().len(),
            pending_recomputes: self.inner.queue.borrow().len(),
        }
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("destroyed", &self.inner.destroyed.get())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Views
// ─────────────────────────────────────────────────────────────────────────────

/// A live view of one location in the state graph
pub struct StateRef {
    inner: Rc<StateInner>,
    path: String,
    tracker: Option<Tracker>,
}

impl StateRef {
    pub(crate) fn new(inner: Rc<StateInner>, path: String, tracker: Option<Tracker>) -> Self {
        Self {
            inner,
            path,
            tracker,
        }
    }

    /// The path this view is anchored at (`""` for the root)
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Sub-view for `key`; constructed fresh on every call
    ///
    /// Constructing a child view counts as a read of its path in a tracking
    /// session, mirroring the fact that reaching a nested container is itself
    /// an observation of it.
    pub fn child(&self, key: &str) -> StateRef {
        let full = path::join(&self.path, key);
        if let Some(tracker) = &self.tracker {
            tracker.borrow_mut().insert(full.clone());
        }
        StateRef::new(self.inner.clone(), full, self.tracker.clone())
    }

    /// Snapshot of the value at `key`; `None` when missing
    pub fn get(&self, key: &str) -> Option<Value> {
        read_path(&self.inner, &path::join(&self.path, key), self.tracker.as_ref())
    }

    /// Snapshot of the value this view points at
    pub fn value(&self) -> Option<Value> {
        read_path(&self.inner, &self.path, self.tracker.as_ref())
    }

    /// Write `value` under `key`; same contract as [`StateHandle::set`]
    pub fn set(&self, key: &str, value: impl Into<Value>) -> bool {
        set_value(&self.inner, &path::join(&self.path, key), value.into())
    }
}

impl std::fmt::Debug for StateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRef").field("path", &self.path).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read / write / notify internals
// ─────────────────────────────────────────────────────────────────────────────

/// Read a path, recording it into an active tracking session
///
/// A path whose first segment names a computed property resolves through the
/// computed cache (re-evaluating synchronously while dirty); remaining
/// segments navigate into the cached value.
pub(crate) fn read_path(
    inner: &Rc<StateInner>,
    path: &str,
    tracker: Option<&Tracker>,
) -> Option<Value> {
    if inner.destroyed.get() {
        return None;
    }
    if let Some(tracker) = tracker {
        if !path.is_empty() {
            tracker.borrow_mut().insert(path.to_string());
        }
    }
    if path.is_empty() {
        return Some(inner.arena.borrow().snapshot_root());
    }
    let head = path::first(path);
    let is_computed = inner.computed.borrow().contains(head);
    if is_computed {
        let base = computed::read_value(inner, head)?;
        let rest = &path[head.len()..];
        if rest.is_empty() {
            Some(base)
        } else {
            base.get_path(&rest[1..]).cloned()
        }
    } else {
        inner.arena.borrow().get_path(path)
    }
}

/// The write path: diff, commit, notify
pub(crate) fn set_value(inner: &Rc<StateInner>, path: &str, value: Value) -> bool {
    if inner.destroyed.get() {
        return false;
    }
    let delivered = value.clone();
    let outcome = inner.arena.borrow_mut().write_path(path, value);
    match outcome {
        WriteOutcome::Committed => {
            notify(inner, path, &delivered);
            true
        }
        WriteOutcome::Unchanged => false,
        WriteOutcome::Missing => {
            tracing::warn!(path, "write dropped: no such location in state graph");
            false
        }
    }
}

/// Deliver a change at `path`: exact subscribers first, then each strict
/// ancestor nearest-first with the live current value of the ancestor path
pub(crate) fn notify(inner: &Rc<StateInner>, path: &str, value: &Value) {
    if inner.destroyed.get() {
        return;
    }
    deliver(inner, path, value);
    for ancestor in path::ancestors(path) {
        if inner.destroyed.get() {
            return;
        }
        let subscribed = inner.registry.borrow().has(ancestor);
        if subscribed {
            let live = read_path(inner, ancestor, None).unwrap_or(Value::Null);
            deliver(inner, ancestor, &live);
        }
    }
}

/// Invoke one path's subscribers over a defensive snapshot
///
/// A panicking callback is reported and skipped; the rest of the snapshot
/// still runs.
fn deliver(inner: &Rc<StateInner>, path: &str, value: &Value) {
    let snapshot = inner.registry.borrow().snapshot(path);
    for callback in snapshot {
        if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
            tracing::error!(path, "state subscriber panicked during delivery");
        }
    }
}
