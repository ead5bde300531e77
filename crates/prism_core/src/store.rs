//! Node arena - the live state graph
//!
//! The data graph is stored as one arena of nodes keyed by [`NodeId`].
//! Composite nodes hold ids of their children rather than inline values, so
//! every tree location has exactly one physical node and any number of views
//! may alias it. Mutation is in-place: a write replaces the child slot of the
//! parent node, never the whole tree.
//!
//! Slotmap keys are versioned, so a view holding the id of a node that was
//! replaced wholesale reads back `None` instead of resurrecting freed storage.

use indexmap::IndexMap;
use slotmap::{new_key_type, SlotMap};

use crate::path;
use crate::value::Value;

new_key_type! {
    /// Unique identifier for a node in the state graph
    pub struct NodeId;
}

/// A single location in the state graph
#[derive(Debug)]
enum Node {
    /// Scalar payload (never `Array`/`Object`; composites decompose on alloc)
    Leaf(Value),
    Object(IndexMap<String, NodeId>),
    Array(Vec<NodeId>),
}

/// Outcome of a write against the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Value differed; the graph was updated
    Committed,
    /// Old and new values were structurally identical scalars; nothing happened
    Unchanged,
    /// An intermediate segment was missing or unwritable
    Missing,
}

/// Arena of state nodes plus the root id
pub struct NodeArena {
    nodes: SlotMap<NodeId, Node>,
    root: NodeId,
}

impl NodeArena {
    /// Build an arena from initial data
    pub fn new(initial: Value) -> Self {
        let mut nodes = SlotMap::with_key();
        let root = Self::alloc_into(&mut nodes, initial);
        Self { nodes, root }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Walk a path from the root; `None` on any missing segment
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for seg in path::segments(path) {
            current = self.step(current, seg)?;
        }
        Some(current)
    }

    /// One navigation step from a node
    pub fn step(&self, id: NodeId, seg: &str) -> Option<NodeId> {
        match self.nodes.get(id)? {
            Node::Object(map) => map.get(seg).copied(),
            Node::Array(items) => items.get(seg.parse::<usize>().ok()?).copied(),
            Node::Leaf(_) => None,
        }
    }

    /// Whether the node behind `id` is a container
    pub fn is_composite(&self, id: NodeId) -> bool {
        matches!(
            self.nodes.get(id),
            Some(Node::Object(_)) | Some(Node::Array(_))
        )
    }

    /// Whether `id` still refers to a live node
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Materialize the subtree under a node
    pub fn snapshot(&self, id: NodeId) -> Option<Value> {
        Some(match self.nodes.get(id)? {
            Node::Leaf(v) => v.clone(),
            Node::Object(map) => Value::Object(
                map.iter()
                    .filter_map(|(k, child)| Some((k.clone(), self.snapshot(*child)?)))
                    .collect(),
            ),
            Node::Array(items) => Value::Array(
                items
                    .iter()
                    .filter_map(|child| self.snapshot(*child))
                    .collect(),
            ),
        })
    }

    /// Materialize the whole graph
    pub fn snapshot_root(&self) -> Value {
        self.snapshot(self.root).unwrap_or(Value::Null)
    }

    /// Read the value at a dot-path
    pub fn get_path(&self, path: &str) -> Option<Value> {
        self.resolve(path).and_then(|id| self.snapshot(id))
    }

    /// Write `value` at `path`, comparing against the previous value first
    ///
    /// Structurally identical scalars commit nothing. Composite values always
    /// commit (a fresh container is never identical to the old one). New keys
    /// may be added to objects; array writes accept in-range indices or the
    /// one-past-the-end index (append).
    pub fn write_path(&mut self, path: &str, value: Value) -> WriteOutcome {
        if path.is_empty() {
            return WriteOutcome::Missing;
        }
        let key = path.rsplit('.').next().unwrap_or(path);
        let parent_path = path::parent(path).unwrap_or("");
        let Some(parent_id) = self.resolve(parent_path) else {
            return WriteOutcome::Missing;
        };
        self.write_child(parent_id, key, value)
    }

    /// Write `value` under `key` of the node `parent`
    pub fn write_child(&mut self, parent: NodeId, key: &str, value: Value) -> WriteOutcome {
        enum Slot {
            ObjectKey,
            ArrayIndex(usize),
            ArrayAppend,
        }

        let (slot, existing) = match self.nodes.get(parent) {
            Some(Node::Object(map)) => (Slot::ObjectKey, map.get(key).copied()),
            Some(Node::Array(items)) => match key.parse::<usize>() {
                Ok(i) if i < items.len() => (Slot::ArrayIndex(i), Some(items[i])),
                Ok(i) if i == items.len() => (Slot::ArrayAppend, None),
                _ => return WriteOutcome::Missing,
            },
            _ => return WriteOutcome::Missing,
        };

        if let Some(old_id) = existing {
            if !value.is_composite() {
                if let Some(Node::Leaf(old)) = self.nodes.get(old_id) {
                    if *old == value {
                        return WriteOutcome::Unchanged;
                    }
                }
            }
            self.free(old_id);
        }

        let new_id = self.alloc(value);
        match (self.nodes.get_mut(parent), slot) {
            (Some(Node::Object(map)), Slot::ObjectKey) => {
                map.insert(key.to_string(), new_id);
            }
            (Some(Node::Array(items)), Slot::ArrayIndex(i)) => {
                items[i] = new_id;
            }
            (Some(Node::Array(items)), Slot::ArrayAppend) => {
                items.push(new_id);
            }
            _ => unreachable!("parent node changed shape mid-write"),
        }
        WriteOutcome::Committed
    }

    /// Remove the entry at `path` and free its subtree
    pub fn remove_path(&mut self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let key = path.rsplit('.').next().unwrap_or(path);
        let parent_path = path::parent(path).unwrap_or("");
        let Some(parent_id) = self.resolve(parent_path) else {
            return false;
        };
        let removed = match self.nodes.get_mut(parent_id) {
            Some(Node::Object(map)) => map.shift_remove(key),
            _ => None,
        };
        match removed {
            Some(child) => {
                self.free(child);
                true
            }
            None => false,
        }
    }

    /// Drop every node and leave an inert null root
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.root = self.nodes.insert(Node::Leaf(Value::Null));
    }

    fn alloc(&mut self, value: Value) -> NodeId {
        Self::alloc_into(&mut self.nodes, value)
    }

    fn alloc_into(nodes: &mut SlotMap<NodeId, Node>, value: Value) -> NodeId {
        match value {
            Value::Object(map) => {
                let children: IndexMap<String, NodeId> = map
                    .into_iter()
                    .map(|(k, v)| (k, Self::alloc_into(nodes, v)))
                    .collect();
                nodes.insert(Node::Object(children))
            }
            Value::Array(items) => {
                let children: Vec<NodeId> = items
                    .into_iter()
                    .map(|v| Self::alloc_into(nodes, v))
                    .collect();
                nodes.insert(Node::Array(children))
            }
            scalar => nodes.insert(Node::Leaf(scalar)),
        }
    }

    fn free(&mut self, id: NodeId) {
        match self.nodes.remove(id) {
            Some(Node::Object(map)) => {
                for (_, child) in map {
                    self.free(child);
                }
            }
            Some(Node::Array(items)) => {
                for child in items {
                    self.free(child);
                }
            }
            _ => {}
        }
    }
}
