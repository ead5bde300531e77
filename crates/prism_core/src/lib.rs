//! Prism Core Runtime
//!
//! This crate provides the reactive state engine underneath the Prism UI
//! toolkit:
//!
//! - **State Graph**: a nested dynamic data graph stored in one node arena,
//!   accessed through live views with an explicit read/write surface
//! - **Path Subscriptions**: path-keyed callbacks with ancestor propagation -
//!   writing `a.b.c` also notifies `a.b` and `a` with their own current values
//! - **Computed Properties**: derived, cached values with automatic dependency
//!   discovery and deferred, coalesced recomputation
//! - **Explicit Scheduling**: invalidated computeds land on a task queue owned
//!   by the state handle, drained by `flush_pending_recomputations` (a host
//!   drains it once per event-loop tick)
//!
//! # Example
//!
//! ```rust
//! use prism_core::{define_computed, StateHandle, Value};
//!
//! let state = StateHandle::new(Value::object([("count", 0)]));
//!
//! let sub = state.subscribe("count", |v| println!("count is now {v}"));
//!
//! let _doubled = define_computed(&state, "doubled", |s| {
//!     Value::Int(s.get("count").and_then(|v| v.as_i64()).unwrap_or(0) * 2)
//! })
//! .unwrap();
//!
//! state.set("count", 21);
//! state.flush_pending_recomputations();
//! assert_eq!(state.get_nested_value("doubled"), Some(Value::Int(42)));
//!
//! sub.dispose();
//! ```

pub mod computed;
pub mod error;
pub mod observe;
pub mod path;
pub mod state;
pub mod store;
pub mod value;

pub use computed::{
    define_computed, define_computed_properties, define_computed_with, ComputedHandle,
    ComputedSet, ComputedSpec, EqualsFn,
};
pub use error::{Result, StateError};
pub use observe::SubscriptionHandle;
pub use state::{StateHandle, StateRef, StateStats};
pub use store::{NodeArena, NodeId, WriteOutcome};
pub use value::{deep_equal, shallow_equal, Value};
