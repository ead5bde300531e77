//! Computed properties with automatic dependency tracking
//!
//! A computed property installs a name on the state whose value is produced
//! by a getter over a tracked view. Every path the getter reads during one
//! invocation is recorded into a fresh dependency set that fully replaces the
//! previous one, so conditional reads retarget the subscriptions on every
//! evaluation. Each dependency path carries an ordinary registry subscription
//! routed at this computed's invalidate handler.
//!
//! Invalidation is deferred and coalescing: a dirty transition enqueues at
//! most one recompute on the state's task queue, drained by
//! `flush_pending_recomputations`. A recompute writes its result back through
//! the ordinary state write path - but only when the configured equality
//! function says the value actually changed - so the computed's own name
//! notifies exactly like a normal property.
//!
//! Reads are lazy: a clean entry returns its cache without invoking the
//! getter; a dirty entry re-evaluates synchronously. A getter panic never
//! disappears - it either propagates out of the read that triggered it, or
//! (during a deferred recompute) is caught, reported, and re-raised by the
//! next synchronous read.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::StateError;
use crate::observe::SubscriberFn;
use crate::state::{self, StateHandle, StateInner, StateRef, Tracker};
use crate::value::{shallow_equal, Value};

/// Getter type for computed properties
pub(crate) type GetterFn = Rc<dyn Fn(&StateRef) -> Value>;

/// Equality function deciding whether a recomputed value counts as changed
pub type EqualsFn = Rc<dyn Fn(&Value, &Value) -> bool>;

/// Upper bound on recomputations per flush; a divergent invalidation cycle
/// between computed properties defers its remainder instead of spinning
const MAX_RECOMPUTES_PER_FLUSH: usize = 1024;

/// Configuration for one computed property
pub struct ComputedSpec {
    getter: GetterFn,
    equals: EqualsFn,
}

impl ComputedSpec {
    /// A computed with the default scalar-level (shallow) equality
    pub fn new(getter: impl Fn(&StateRef) -> Value + 'static) -> Self {
        Self {
            getter: Rc::new(getter),
            equals: Rc::new(shallow_equal),
        }
    }

    /// Override the change-detection equality (e.g. [`crate::value::deep_equal`])
    pub fn with_equals(mut self, equals: impl Fn(&Value, &Value) -> bool + 'static) -> Self {
        self.equals = Rc::new(equals);
        self
    }
}

struct ComputedEntry {
    getter: GetterFn,
    equals: EqualsFn,
    /// Most recent evaluation result
    cached: Option<Value>,
    /// Last value written back through the state write path (the baseline for
    /// change detection at the next deferred recompute)
    published: Option<Value>,
    dirty: bool,
    scheduled: bool,
    /// Guards against re-entrant evaluation of the same entry
    evaluating: bool,
    /// Dependency path -> registry entry id, fully replaced per evaluation
    deps: FxHashMap<String, u64>,
}

/// Table of computed entries, keyed by property name
pub(crate) struct ComputedTable {
    entries: FxHashMap<String, ComputedEntry>,
}

impl ComputedTable {
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Forget every recorded dependency link
    ///
    /// Called when the registry side has already been cleared wholesale, so
    /// the next evaluation re-subscribes everything it still reads instead of
    /// treating the dead links as live.
    pub fn forget_links(&mut self) {
        for entry in self.entries.values_mut() {
            entry.deps.clear();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Definition / removal
// ─────────────────────────────────────────────────────────────────────────────

/// Install `name` as a computed property of `state`
///
/// The getter runs once immediately to seed the cache and discover its
/// dependency set. A getter that panics during this initial run does not fail
/// the definition: the entry stays permanently dirty and every subsequent
/// read re-attempts the evaluation, re-raising while it keeps panicking.
pub fn define_computed(
    state: &StateHandle,
    name: &str,
    getter: impl Fn(&StateRef) -> Value + 'static,
) -> crate::error::Result<ComputedHandle> {
    define_computed_with(state, name, ComputedSpec::new(getter))
}

/// [`define_computed`] with explicit configuration
pub fn define_computed_with(
    state: &StateHandle,
    name: &str,
    spec: ComputedSpec,
) -> crate::error::Result<ComputedHandle> {
    let inner = state.inner();
    if inner.destroyed.get() {
        return Err(StateError::Destroyed);
    }
    if name.is_empty() || name.contains('.') {
        return Err(StateError::InvalidName(name.to_string()));
    }
    {
        let mut table = inner.computed.borrow_mut();
        if table.entries.contains_key(name) {
            return Err(StateError::DuplicateComputed(name.to_string()));
        }
        table.entries.insert(
            name.to_string(),
            ComputedEntry {
                getter: spec.getter,
                equals: spec.equals,
                cached: None,
                published: None,
                dirty: true,
                scheduled: false,
                evaluating: false,
                deps: FxHashMap::default(),
            },
        );
    }

    match evaluate(inner, name) {
        Err(_) => {
            tracing::error!(name, "computed getter panicked during definition");
        }
        Ok(Evaluated::Done { self_dep: true, .. }) => {
            remove(inner, name);
            return Err(StateError::SelfDependency(name.to_string()));
        }
        Ok(Evaluated::Done { .. }) => {
            // baseline for change detection; installation itself notifies nothing
            let mut table = inner.computed.borrow_mut();
            if let Some(entry) = table.entries.get_mut(name) {
                entry.published = entry.cached.clone();
            }
        }
        Ok(_) => {}
    }

    Ok(ComputedHandle {
        state: Rc::downgrade(inner),
        name: name.to_string(),
        removed: Cell::new(false),
    })
}

/// Define several computed properties at once; one handle tears down all
///
/// Definitions are installed in order. If any fails, the ones already
/// installed are removed again and the error is returned.
pub fn define_computed_properties<N, I>(
    state: &StateHandle,
    props: I,
) -> crate::error::Result<ComputedSet>
where
    N: Into<String>,
    I: IntoIterator<Item = (N, ComputedSpec)>,
{
    let mut handles = Vec::new();
    for (name, spec) in props {
        match define_computed_with(state, &name.into(), spec) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                for handle in &handles {
                    handle.remove();
                }
                return Err(err);
            }
        }
    }
    Ok(ComputedSet { handles })
}

/// Disposer for one computed property
pub struct ComputedHandle {
    state: Weak<StateInner>,
    name: String,
    removed: Cell<bool>,
}

impl ComputedHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unsubscribe every dependency and delete the property; idempotent
    pub fn remove(&self) {
        if self.removed.replace(true) {
            return;
        }
        if let Some(inner) = self.state.upgrade() {
            remove(&inner, &self.name);
        }
    }
}

/// Disposer for a batch of computed properties
pub struct ComputedSet {
    handles: Vec<ComputedHandle>,
}

impl ComputedSet {
    pub fn handles(&self) -> &[ComputedHandle] {
        &self.handles
    }

    /// Remove every property in the batch; idempotent
    pub fn remove(&self) {
        for handle in &self.handles {
            handle.remove();
        }
    }
}

pub(crate) fn remove(inner: &Rc<StateInner>, name: &str) {
    let Some(entry) = inner.computed.borrow_mut().entries.remove(name) else {
        return;
    };
    {
        let mut registry = inner.registry.borrow_mut();
        for (path, id) in &entry.deps {
            registry.remove(path, *id);
        }
    }
    // drop the written-back tree copy, if any
    inner.arena.borrow_mut().remove_path(name);
}

// ─────────────────────────────────────────────────────────────────────────────
// Invalidation / scheduling
// ─────────────────────────────────────────────────────────────────────────────

/// Mark an entry dirty and enqueue at most one deferred recompute
pub(crate) fn invalidate(inner: &Rc<StateInner>, name: &str) {
    if inner.destroyed.get() {
        return;
    }
    let mut table = inner.computed.borrow_mut();
    let Some(entry) = table.entries.get_mut(name) else {
        return;
    };
    entry.dirty = true;
    if !entry.scheduled {
        entry.scheduled = true;
        inner.queue.borrow_mut().push_back(name.to_string());
    }
}

/// Drain the deferred recompute queue
///
/// Re-entrant calls while a drain is in progress return immediately; the
/// outer drain picks up any work enqueued in the meantime.
pub(crate) fn flush(inner: &Rc<StateInner>) {
    if inner.destroyed.get() || inner.flushing.replace(true) {
        return;
    }
    let mut budget = MAX_RECOMPUTES_PER_FLUSH;
    loop {
        if inner.destroyed.get() {
            break;
        }
        let Some(name) = inner.queue.borrow_mut().pop_front() else {
            break;
        };
        {
            let mut table = inner.computed.borrow_mut();
            let Some(entry) = table.entries.get_mut(&name) else {
                continue;
            };
            entry.scheduled = false;
        }
        if budget == 0 {
            if let Some(entry) = inner.computed.borrow_mut().entries.get_mut(&name) {
                entry.scheduled = true;
            }
            inner.queue.borrow_mut().push_front(name);
            tracing::warn!(
                limit = MAX_RECOMPUTES_PER_FLUSH,
                "recompute cascade exceeded flush budget; remainder deferred"
            );
            break;
        }
        budget -= 1;
        recompute_deferred(inner, &name);
    }
    inner.flushing.set(false);
}

fn recompute_deferred(inner: &Rc<StateInner>, name: &str) {
    let dirty = {
        let table = inner.computed.borrow();
        let Some(entry) = table.entries.get(name) else {
            return;
        };
        entry.dirty
    };
    if dirty {
        match evaluate(inner, name) {
            Err(_) => {
                // stays dirty; the next synchronous read re-raises
                tracing::error!(name, "computed getter panicked during deferred recompute");
                return;
            }
            Ok(Evaluated::Done { self_dep, .. }) => {
                if self_dep {
                    tracing::error!(name, "computed getter reads its own property; self link dropped");
                }
            }
            Ok(Evaluated::Reentrant) | Ok(Evaluated::Missing) => return,
        }
    }

    // Publish when the freshly cached value differs from the last published
    // one. A synchronous dirty read may have refreshed the cache before this
    // deferred slot ran; the publish comparison still fires exactly once.
    let (new, published, equals) = {
        let table = inner.computed.borrow();
        let Some(entry) = table.entries.get(name) else {
            return;
        };
        (entry.cached.clone(), entry.published.clone(), entry.equals.clone())
    };
    let Some(new) = new else { return };
    let changed = match &published {
        Some(previous) => !equals(previous, &new),
        None => true,
    };
    if changed {
        if let Some(entry) = inner.computed.borrow_mut().entries.get_mut(name) {
            entry.published = Some(new.clone());
        }
        // the ordinary write path, so the computed's own name notifies its
        // subscribers exactly as a normal property would
        state::set_value(inner, name, new);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation
// ─────────────────────────────────────────────────────────────────────────────

enum Evaluated {
    Done {
        new: Value,
        self_dep: bool,
    },
    /// The entry is already mid-evaluation on this stack
    Reentrant,
    /// The entry was removed out from under us
    Missing,
}

/// Read a computed property, evaluating synchronously while dirty
pub(crate) fn read_value(inner: &Rc<StateInner>, name: &str) -> Option<Value> {
    let (dirty, evaluating, cached) = {
        let table = inner.computed.borrow();
        let entry = table.entries.get(name)?;
        (entry.dirty, entry.evaluating, entry.cached.clone())
    };
    if evaluating || !dirty {
        return cached;
    }
    match evaluate(inner, name) {
        // a panic from definition time or a deferred recompute surfaces here
        Err(payload) => resume_unwind(payload),
        Ok(Evaluated::Done { new, self_dep }) => {
            if self_dep {
                tracing::error!(name, "computed getter reads its own property; self link dropped");
            }
            Some(new)
        }
        Ok(Evaluated::Reentrant) => cached,
        Ok(Evaluated::Missing) => None,
    }
}

/// Run the getter against a tracked view and resynchronize dependencies
fn evaluate(
    inner: &Rc<StateInner>,
    name: &str,
) -> std::result::Result<Evaluated, Box<dyn std::any::Any + Send>> {
    let getter = {
        let mut table = inner.computed.borrow_mut();
        let Some(entry) = table.entries.get_mut(name) else {
            return Ok(Evaluated::Missing);
        };
        if entry.evaluating {
            return Ok(Evaluated::Reentrant);
        }
        entry.evaluating = true;
        entry.getter.clone()
    };

    // explicit recording session, pushed for exactly this one getter call
    let tracker: Tracker = Rc::new(RefCell::new(FxHashSet::default()));
    let view = StateRef::new(inner.clone(), String::new(), Some(tracker.clone()));
    let outcome = catch_unwind(AssertUnwindSafe(|| getter(&view)));

    if let Some(entry) = inner.computed.borrow_mut().entries.get_mut(name) {
        entry.evaluating = false;
    }

    let new = match outcome {
        Ok(value) => value,
        // dirty stays set; dependency set keeps its previous shape
        Err(payload) => return Err(payload),
    };

    let mut new_deps: FxHashSet<String> = std::mem::take(&mut *tracker.borrow_mut());
    let self_dep = new_deps.remove(name);

    resync_dependencies(inner, name, &new_deps);

    {
        let mut table = inner.computed.borrow_mut();
        let Some(entry) = table.entries.get_mut(name) else {
            return Ok(Evaluated::Missing);
        };
        entry.dirty = false;
        entry.cached = Some(new.clone());
    }
    Ok(Evaluated::Done { new, self_dep })
}

/// Replace the dependency set: unsubscribe paths no longer read, subscribe
/// newly discovered ones, all routed at this computed's invalidate handler
fn resync_dependencies(inner: &Rc<StateInner>, name: &str, new_deps: &FxHashSet<String>) {
    let (stale, added) = {
        let table = inner.computed.borrow();
        let Some(entry) = table.entries.get(name) else {
            return;
        };
        let stale: Vec<(String, u64)> = entry
            .deps
            .iter()
            .filter(|(path, _)| !new_deps.contains(*path))
            .map(|(path, id)| (path.clone(), *id))
            .collect();
        let added: Vec<String> = new_deps
            .iter()
            .filter(|path| !entry.deps.contains_key(*path))
            .cloned()
            .collect();
        (stale, added)
    };

    let mut fresh: Vec<(String, u64)> = Vec::with_capacity(added.len());
    {
        let mut registry = inner.registry.borrow_mut();
        for (path, id) in &stale {
            registry.remove(path, *id);
        }
        for path in added {
            let weak = Rc::downgrade(inner);
            let target = name.to_string();
            let callback: SubscriberFn = Rc::new(move |_value: &Value| {
                if let Some(inner) = weak.upgrade() {
                    invalidate(&inner, &target);
                }
            });
            let id = registry.insert(&path, callback);
            fresh.push((path, id));
        }
    }

    let mut table = inner.computed.borrow_mut();
    let Some(entry) = table.entries.get_mut(name) else {
        // entry vanished mid-resync; roll the fresh subscriptions back
        drop(table);
        let mut registry = inner.registry.borrow_mut();
        for (path, id) in &fresh {
            registry.remove(path, *id);
        }
        return;
    };
    entry.deps.retain(|path, _| new_deps.contains(path));
    for (path, id) in fresh {
        entry.deps.insert(path, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateHandle;
    use crate::value::deep_equal;
    use serde_json::json;

    fn state(data: serde_json::Value) -> StateHandle {
        StateHandle::new(Value::from(data))
    }

    fn int(s: &StateRef, key: &str) -> i64 {
        s.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
    }

    /// Counts getter invocations alongside the computed value
    fn counting_sum(calls: Rc<Cell<usize>>) -> impl Fn(&StateRef) -> Value {
        move |s| {
            calls.set(calls.get() + 1);
            Value::Int(int(s, "a") + int(s, "b"))
        }
    }

    #[test]
    fn test_basic_read() {
        let s = state(json!({"a": 1, "b": 2}));
        let _c = define_computed(&s, "sum", |s| Value::Int(int(s, "a") + int(s, "b"))).unwrap();
        assert_eq!(s.get_nested_value("sum"), Some(Value::Int(3)));
    }

    #[test]
    fn test_recompute_after_dependency_change() {
        let s = state(json!({"a": 1, "b": 2}));
        let _c = define_computed(&s, "sum", |s| Value::Int(int(s, "a") + int(s, "b"))).unwrap();

        s.set("a", 5);
        s.flush_pending_recomputations();
        assert_eq!(s.get_nested_value("sum"), Some(Value::Int(7)));
    }

    #[test]
    fn test_no_spurious_recompute_on_unrelated_change() {
        let s = state(json!({"a": 1, "b": 2, "noise": 0}));
        let calls = Rc::new(Cell::new(0));
        let _c = define_computed(&s, "sum", counting_sum(calls.clone())).unwrap();
        let after_define = calls.get();

        s.set("noise", 99);
        s.flush_pending_recomputations();
        assert_eq!(calls.get(), after_define);
    }

    #[test]
    fn test_cached_reads_do_not_reinvoke_getter() {
        let s = state(json!({"a": 1, "b": 2}));
        let calls = Rc::new(Cell::new(0));
        let _c = define_computed(&s, "sum", counting_sum(calls.clone())).unwrap();
        assert_eq!(calls.get(), 1);

        let _ = s.get_nested_value("sum");
        let _ = s.get_nested_value("sum");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_multiple_writes_coalesce_into_one_recompute() {
        let s = state(json!({"a": 1, "b": 2}));
        let calls = Rc::new(Cell::new(0));
        let _c = define_computed(&s, "sum", counting_sum(calls.clone())).unwrap();

        s.set("a", 10);
        s.set("b", 20);
        s.set("a", 11);
        s.flush_pending_recomputations();
        assert_eq!(calls.get(), 2);
        assert_eq!(s.get_nested_value("sum"), Some(Value::Int(31)));
    }

    #[test]
    fn test_writeback_notifies_subscribers_of_computed_name() {
        let s = state(json!({"a": 1, "b": 2}));
        let _c = define_computed(&s, "sum", |s| Value::Int(int(s, "a") + int(s, "b"))).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let _sub = s.subscribe("sum", move |v| sink.borrow_mut().push(v.clone()));

        s.set("a", 5);
        s.flush_pending_recomputations();
        assert_eq!(*log.borrow(), vec![Value::Int(7)]);
    }

    #[test]
    fn test_sync_dirty_read_then_flush_still_publishes_once() {
        let s = state(json!({"a": 1, "b": 2}));
        let _c = define_computed(&s, "sum", |s| Value::Int(int(s, "a") + int(s, "b"))).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let _sub = s.subscribe("sum", move |v| sink.borrow_mut().push(v.clone()));

        s.set("a", 5);
        // synchronous read while dirty evaluates immediately...
        assert_eq!(s.get_nested_value("sum"), Some(Value::Int(7)));
        assert!(log.borrow().is_empty());
        // ...and the deferred slot still publishes the change exactly once
        s.flush_pending_recomputations();
        assert_eq!(*log.borrow(), vec![Value::Int(7)]);
        s.flush_pending_recomputations();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_deep_equals_suppresses_unchanged_output() {
        let s = state(json!({"n": 2}));
        let spec = ComputedSpec::new(|s| Value::object([("even", int(s, "n") % 2 == 0)]))
            .with_equals(deep_equal);
        let _c = define_computed_with(&s, "parity", spec).unwrap();

        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let _sub = s.subscribe("parity", move |_| h.set(h.get() + 1));

        // 2 -> 4: inputs changed, output structurally identical
        s.set("n", 4);
        s.flush_pending_recomputations();
        assert_eq!(hits.get(), 0);

        // 4 -> 5: output flips
        s.set("n", 5);
        s.flush_pending_recomputations();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_default_shallow_equals_reports_fresh_containers_as_changed() {
        let s = state(json!({"n": 2}));
        let _c = define_computed(&s, "parity", |s| {
            Value::object([("even", int(s, "n") % 2 == 0)])
        })
        .unwrap();

        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let _sub = s.subscribe("parity", move |_| h.set(h.get() + 1));

        s.set("n", 4);
        s.flush_pending_recomputations();
        s.set("n", 6);
        s.flush_pending_recomputations();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_conditional_dependencies_are_replaced() {
        let s = state(json!({"use_a": true, "a": 1, "b": 2}));
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let _c = define_computed(&s, "pick", move |s| {
            c.set(c.get() + 1);
            if s.get("use_a").and_then(|v| v.as_bool()).unwrap_or(false) {
                Value::Int(int(s, "a"))
            } else {
                Value::Int(int(s, "b"))
            }
        })
        .unwrap();
        assert_eq!(calls.get(), 1);

        s.set("use_a", false);
        s.flush_pending_recomputations();
        assert_eq!(s.get_nested_value("pick"), Some(Value::Int(2)));
        let after_flip = calls.get();

        // `a` is no longer in the dependency set
        s.set("a", 100);
        s.flush_pending_recomputations();
        assert_eq!(calls.get(), after_flip);

        s.set("b", 50);
        s.flush_pending_recomputations();
        assert_eq!(calls.get(), after_flip + 1);
        assert_eq!(s.get_nested_value("pick"), Some(Value::Int(50)));
    }

    #[test]
    fn test_nested_path_dependency() {
        let s = state(json!({"user": {"name": "A"}}));
        let _c = define_computed(&s, "greet", |s| {
            let name = s
                .child("user")
                .get("name")
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            Value::Str(format!("Hi {name}"))
        })
        .unwrap();
        assert_eq!(s.get_nested_value("greet"), Some(Value::Str("Hi A".into())));

        s.set("user.name", "B");
        s.flush_pending_recomputations();
        assert_eq!(s.get_nested_value("greet"), Some(Value::Str("Hi B".into())));
    }

    #[test]
    fn test_computed_on_computed() {
        let s = state(json!({"a": 1, "b": 2}));
        let _sum = define_computed(&s, "sum", |s| Value::Int(int(s, "a") + int(s, "b"))).unwrap();
        let _dbl = define_computed(&s, "double", |s| Value::Int(int(s, "sum") * 2)).unwrap();
        assert_eq!(s.get_nested_value("double"), Some(Value::Int(6)));

        s.set("a", 10);
        s.flush_pending_recomputations();
        assert_eq!(s.get_nested_value("double"), Some(Value::Int(24)));
    }

    #[test]
    fn test_panic_at_definition_is_lazy() {
        let s = state(json!({}));
        let result = define_computed(&s, "boom", |_| panic!("getter failure"));
        // definition succeeds; the failure belongs to reads
        let _handle = result.unwrap();

        for _ in 0..2 {
            let caught = catch_unwind(AssertUnwindSafe(|| s.get_nested_value("boom")));
            assert!(caught.is_err());
        }
    }

    #[test]
    fn test_panic_during_deferred_recompute_surfaces_on_next_read() {
        let s = state(json!({"mode": "ok"}));
        let _c = define_computed(&s, "risky", |s| {
            let mode = s.get("mode").and_then(|v| v.as_str().map(String::from));
            match mode.as_deref() {
                Some("bad") => panic!("recompute failure"),
                other => Value::Str(other.unwrap_or("?").to_string()),
            }
        })
        .unwrap();
        assert_eq!(s.get_nested_value("risky"), Some(Value::Str("ok".into())));

        s.set("mode", "bad");
        // the flush itself survives the panic
        s.flush_pending_recomputations();

        let caught = catch_unwind(AssertUnwindSafe(|| s.get_nested_value("risky")));
        assert!(caught.is_err());

        // and the entry recovers once the getter stops panicking
        s.set("mode", "fine");
        s.flush_pending_recomputations();
        assert_eq!(s.get_nested_value("risky"), Some(Value::Str("fine".into())));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let s = state(json!({"a": 1}));
        let result = define_computed(&s, "loop", |s| Value::Int(int(s, "loop") + 1));
        assert!(matches!(result, Err(StateError::SelfDependency(_))));
        // the partial definition was rolled back
        assert_eq!(s.get_nested_value("loop"), None);
        assert_eq!(s.stats().computed_count, 0);
    }

    #[test]
    fn test_invalid_and_duplicate_names() {
        let s = state(json!({"a": 1}));
        assert!(matches!(
            define_computed(&s, "", |_| Value::Null),
            Err(StateError::InvalidName(_))
        ));
        assert!(matches!(
            define_computed(&s, "a.b", |_| Value::Null),
            Err(StateError::InvalidName(_))
        ));
        let _first = define_computed(&s, "c", |_| Value::Int(1)).unwrap();
        assert!(matches!(
            define_computed(&s, "c", |_| Value::Int(2)),
            Err(StateError::DuplicateComputed(_))
        ));
    }

    #[test]
    fn test_remove_stops_recomputation_and_deletes_property() {
        let s = state(json!({"a": 1, "b": 2}));
        let calls = Rc::new(Cell::new(0));
        let handle = define_computed(&s, "sum", counting_sum(calls.clone())).unwrap();
        s.set("a", 5);
        s.flush_pending_recomputations();
        let before = calls.get();

        handle.remove();
        handle.remove();
        assert_eq!(s.get_nested_value("sum"), None);

        s.set("a", 9);
        s.flush_pending_recomputations();
        assert_eq!(calls.get(), before);
    }

    #[test]
    fn test_bulk_definition_and_single_disposer() {
        let s = state(json!({"a": 1, "b": 2}));
        let set = define_computed_properties(
            &s,
            [
                ("sum", ComputedSpec::new(|s| Value::Int(int(s, "a") + int(s, "b")))),
                ("diff", ComputedSpec::new(|s| Value::Int(int(s, "a") - int(s, "b")))),
            ],
        )
        .unwrap();
        assert_eq!(s.get_nested_value("sum"), Some(Value::Int(3)));
        assert_eq!(s.get_nested_value("diff"), Some(Value::Int(-1)));
        assert_eq!(s.stats().computed_count, 2);

        set.remove();
        assert_eq!(s.stats().computed_count, 0);
        assert_eq!(s.get_nested_value("sum"), None);
    }

    #[test]
    fn test_bulk_definition_rolls_back_on_error() {
        let s = state(json!({"a": 1}));
        let result = define_computed_properties(
            &s,
            [
                ("ok", ComputedSpec::new(|s| Value::Int(int(s, "a")))),
                ("bad.name", ComputedSpec::new(|_| Value::Null)),
            ],
        );
        assert!(matches!(result, Err(StateError::InvalidName(_))));
        assert_eq!(s.stats().computed_count, 0);
        assert_eq!(s.get_nested_value("ok"), None);
    }

    #[test]
    fn test_snapshot_contains_computed_after_writeback() {
        let s = state(json!({"a": 1, "b": 2}));
        let _c = define_computed(&s, "sum", |s| Value::Int(int(s, "a") + int(s, "b"))).unwrap();
        // not yet written back
        assert_eq!(s.snapshot().get_path("sum"), None);

        s.set("a", 5);
        s.flush_pending_recomputations();
        assert_eq!(s.snapshot().get_path("sum"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_path_into_composite_computed_value() {
        let s = state(json!({"first": "Ada", "last": "L"}));
        let _c = define_computed(&s, "names", |s| {
            Value::object([
                ("first", s.get("first").unwrap_or(Value::Null)),
                ("last", s.get("last").unwrap_or(Value::Null)),
            ])
        })
        .unwrap();
        assert_eq!(
            s.get_nested_value("names.first"),
            Some(Value::Str("Ada".into()))
        );
        assert_eq!(s.get_nested_value("names.missing"), None);
    }

    #[test]
    fn test_divergent_cycle_is_bounded_by_flush_budget() {
        let s = state(json!({"seed": 0}));
        let _a = define_computed(&s, "ping", |s| {
            Value::Int(int(s, "seed") + int(s, "pong") + 1)
        })
        .unwrap();
        let _b = define_computed(&s, "pong", |s| Value::Int(int(s, "ping") + 1)).unwrap();

        s.set("seed", 1);
        // each writeback re-invalidates the other entry; the flush budget
        // breaks the spin and leaves the remainder pending
        s.flush_pending_recomputations();
        assert!(s.stats().pending_recomputes >= 1);
    }

    #[test]
    fn test_unsubscribe_all_detaches_links_until_next_evaluation() {
        let s = state(json!({"a": 1, "b": 2}));
        let _c = define_computed(&s, "sum", |s| Value::Int(int(s, "a") + int(s, "b"))).unwrap();

        // leave the entry dirty, then drop every subscription
        s.set("a", 5);
        s.unsubscribe_all();

        // the dirty read evaluates and re-registers both dependency links
        assert_eq!(s.get_nested_value("sum"), Some(Value::Int(7)));

        s.set("b", 10);
        s.flush_pending_recomputations();
        assert_eq!(s.get_nested_value("sum"), Some(Value::Int(15)));
    }

    #[test]
    fn test_unsubscribe_all_halts_clean_computed() {
        let s = state(json!({"a": 1, "b": 2}));
        let calls = Rc::new(Cell::new(0));
        let _c = define_computed(&s, "sum", counting_sum(calls.clone())).unwrap();
        let before = calls.get();

        s.unsubscribe_all();

        // no link fires, so the cached value goes stale and stays cached
        s.set("a", 100);
        s.flush_pending_recomputations();
        assert_eq!(calls.get(), before);
        assert_eq!(s.get_nested_value("sum"), Some(Value::Int(3)));
    }

    #[test]
    fn test_define_on_destroyed_state() {
        let s = state(json!({"a": 1}));
        s.destroy();
        assert!(matches!(
            define_computed(&s, "sum", |_| Value::Null),
            Err(StateError::Destroyed)
        ));
    }
}
