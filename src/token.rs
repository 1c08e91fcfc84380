//! Node identity and the shared node registry.
//!
//! Every node owns a [`Token`]: a process-unique id plus a handle to the
//! [`NodeMap`] it lives in. Declaring a relation between two tokens merges
//! their maps (union-find), so all nodes reachable from one another always
//! share a single canonical map. The map also owns the relation sets and
//! the table of named, shared datastructures, keeping graph traversal
//! O(|edges|) instead of per-node.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::{Dynamic, MemorySize, NodeId};
use crate::error::PipelineError;
use crate::node::{NodeRef, WeakNodeRef};

/// Kind of a declared relation between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// The source pushes items to the target.
    Push,
    /// The source pulls items from the target.
    Pull,
    /// The source must have ended before the target begins.
    Dependency,
}

/// A declared relation between two registered nodes.
///
/// For [`Relation::Dependency`] the edge is stored producer-first: `source`
/// ends before `target` begins. Dependency edges are always buffered.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub relation: Relation,
    pub buffered: bool,
}

impl Edge {
    /// The endpoints in item direction: who produces, who consumes.
    pub(crate) fn producer_consumer(&self) -> (NodeId, NodeId) {
        match self.relation {
            Relation::Push | Relation::Dependency => (self.source, self.target),
            Relation::Pull => (self.target, self.source),
        }
    }
}

/// Map-level slot of a shared datastructure: the opaque value and the
/// memory assigned for the current phase. The bounds and priority are
/// declared per node and folded by the memory runtime.
#[derive(Clone, Default)]
pub(crate) struct DatastructureSlot {
    pub assigned: MemorySize,
    pub value: Option<(Dynamic, &'static str)>,
}

#[derive(Default)]
struct MapState {
    /// Set when this map has been merged into another one; all operations
    /// follow the chain to the canonical map.
    redirect: Option<NodeMap>,
    nodes: BTreeMap<NodeId, WeakNodeRef>,
    relations: Vec<Edge>,
    datastructures: BTreeMap<String, DatastructureSlot>,
}

/// Shared registry of nodes, relations and named datastructures.
///
/// Cloning a `NodeMap` clones the handle, not the state. Linking two maps
/// merges their state into one canonical map; the operation is idempotent
/// and commutative.
#[derive(Clone)]
pub struct NodeMap {
    inner: Arc<Mutex<MapState>>,
}

impl Default for NodeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MapState::default())),
        }
    }

    /// Follows redirects to the canonical map, compressing the path.
    pub(crate) fn find(&self) -> NodeMap {
        let parent = self.inner.lock().unwrap().redirect.clone();
        match parent {
            None => self.clone(),
            Some(parent) => {
                let root = parent.find();
                if !Arc::ptr_eq(&root.inner, &parent.inner) {
                    self.inner.lock().unwrap().redirect = Some(root.clone());
                }
                root
            }
        }
    }

    /// True if both handles resolve to the same canonical map.
    pub fn ptr_eq(a: &NodeMap, b: &NodeMap) -> bool {
        Arc::ptr_eq(&a.find().inner, &b.find().inner)
    }

    /// Merges `other` into this map. Idempotent and commutative.
    pub fn link(&self, other: &NodeMap) {
        let a = self.find();
        let b = other.find();
        if Arc::ptr_eq(&a.inner, &b.inner) {
            return;
        }

        // Lock in address order so concurrent links cannot deadlock.
        let a_first = Arc::as_ptr(&a.inner) < Arc::as_ptr(&b.inner);
        let (mut ga, mut gb);
        if a_first {
            ga = a.inner.lock().unwrap();
            gb = b.inner.lock().unwrap();
        } else {
            gb = b.inner.lock().unwrap();
            ga = a.inner.lock().unwrap();
        }

        ga.nodes.append(&mut gb.nodes);
        ga.relations.append(&mut gb.relations);
        for (name, slot) in std::mem::take(&mut gb.datastructures) {
            merge_slot(ga.datastructures.entry(name).or_default(), slot);
        }
        gb.redirect = Some(a.clone());
    }

    pub(crate) fn register(&self, id: NodeId, node: WeakNodeRef) {
        self.find().inner.lock().unwrap().nodes.insert(id, node);
    }

    pub(crate) fn forget(&self, id: NodeId) {
        self.find().inner.lock().unwrap().nodes.remove(&id);
    }

    /// Resolves a node by id; fails if the owner was never added to a
    /// pipeline or has already been destroyed.
    pub(crate) fn node(&self, id: NodeId) -> Result<NodeRef, PipelineError> {
        self.find()
            .inner
            .lock()
            .unwrap()
            .nodes
            .get(&id)
            .and_then(WeakNodeRef::upgrade)
            .ok_or(PipelineError::MissingNode(id))
    }

    /// Ids of all registered nodes, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.find().inner.lock().unwrap().nodes.keys().copied().collect()
    }

    /// Declares a relation between two tokens, linking their maps first.
    ///
    /// Direction follows the caller: `a` pushes to / pulls from / depends
    /// on `b`. Dependency edges are stored producer-first and are always
    /// buffered.
    pub fn relate(a: &Token, b: &Token, relation: Relation, buffered: bool) {
        a.map.link(&b.map);
        let edge = match relation {
            Relation::Push | Relation::Pull => Edge {
                source: a.id,
                target: b.id,
                relation,
                buffered,
            },
            Relation::Dependency => Edge {
                source: b.id,
                target: a.id,
                relation,
                buffered: true,
            },
        };
        a.map.find().inner.lock().unwrap().relations.push(edge);
    }

    /// Snapshot of all declared relations.
    pub fn relations(&self) -> Vec<Edge> {
        self.find().inner.lock().unwrap().relations.clone()
    }

    pub(crate) fn register_datastructure(&self, name: &str) {
        let root = self.find();
        let mut state = root.inner.lock().unwrap();
        state.datastructures.entry(name.to_string()).or_default();
    }

    pub(crate) fn set_datastructure_value(
        &self,
        name: &str,
        value: Dynamic,
        type_name: &'static str,
    ) -> Result<(), PipelineError> {
        let root = self.find();
        let mut state = root.inner.lock().unwrap();
        let slot = state
            .datastructures
            .get_mut(name)
            .ok_or_else(|| PipelineError::UnregisteredDatastructure(name.to_string()))?;
        slot.value = Some((value, type_name));
        Ok(())
    }

    pub(crate) fn datastructure_value(
        &self,
        name: &str,
    ) -> Result<(Dynamic, &'static str), PipelineError> {
        let root = self.find();
        let state = root.inner.lock().unwrap();
        let slot = state
            .datastructures
            .get(name)
            .ok_or_else(|| PipelineError::UnregisteredDatastructure(name.to_string()))?;
        slot.value
            .clone()
            .ok_or_else(|| PipelineError::UnregisteredDatastructure(name.to_string()))
    }

    pub(crate) fn datastructure_assigned(&self, name: &str) -> Result<MemorySize, PipelineError> {
        let root = self.find();
        let state = root.inner.lock().unwrap();
        state
            .datastructures
            .get(name)
            .map(|slot| slot.assigned)
            .ok_or_else(|| PipelineError::UnregisteredDatastructure(name.to_string()))
    }

    pub(crate) fn assign_datastructure_memory(&self, name: &str, assigned: MemorySize) {
        let root = self.find();
        let mut state = root.inner.lock().unwrap();
        if let Some(slot) = state.datastructures.get_mut(name) {
            slot.assigned = assigned;
        }
    }
}

fn merge_slot(into: &mut DatastructureSlot, from: DatastructureSlot) {
    into.assigned = into.assigned.max(from.assigned);
    if into.value.is_none() {
        into.value = from.value;
    }
}

/// Identity of a node within a [`NodeMap`].
///
/// Two tokens are equal iff they carry the same id and resolve to the same
/// canonical map. A token stays valid for as long as any node claims its
/// id; resolving a token whose owner is gone yields
/// [`PipelineError::MissingNode`].
#[derive(Clone)]
pub struct Token {
    id: NodeId,
    map: NodeMap,
}

impl Token {
    /// Creates a fresh token in a new map of its own.
    pub fn new() -> Self {
        Self {
            id: NodeId::fresh(),
            map: NodeMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The canonical map this token currently belongs to.
    pub fn map(&self) -> NodeMap {
        self.map.find()
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && NodeMap::ptr_eq(&self.map, &other.map)
    }
}

impl Eq for Token {}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({})", self.id)
    }
}
