//! The phase planner.
//!
//! Buffered edges (and every dependency edge) are phase boundaries: their
//! producer must have ended before their consumer begins. The planner
//! removes all boundary edges, takes the connected components of the
//! remaining actor graph as phases, orders the phases along the removed
//! edges, and orders the nodes inside each phase along the item-flow
//! edges. Every ambiguity is resolved by ascending token id, so planning
//! the same graph twice yields the same plan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use petgraph::unionfind::UnionFind;

use crate::core::{NamePriority, NodeId};
use crate::error::PipelineError;
use crate::graph::GraphView;
use crate::token::NodeMap;

/// One phase: a maximal set of nodes connected by non-buffered actor
/// edges, executed as a unit.
#[derive(Debug)]
pub struct Phase {
    pub(crate) name: String,
    /// Nodes in item-flow topological order.
    pub(crate) nodes: Vec<NodeId>,
    /// The unique source of the actor graph within this phase.
    pub(crate) initiator: NodeId,
}

impl Phase {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in item-flow topological order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn initiator(&self) -> NodeId {
        self.initiator
    }
}

/// The ordered phase partition of a node graph.
#[derive(Debug)]
pub struct PhasePlan {
    pub(crate) phases: Vec<Phase>,
}

impl PhasePlan {
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// The index of the phase containing `id`, if any.
    pub fn phase_of(&self, id: NodeId) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.nodes.contains(&id))
    }
}

pub(crate) fn plan(map: &NodeMap) -> Result<PhasePlan, PipelineError> {
    let ids = map.node_ids();
    let edges = map.relations();

    let id_set: BTreeSet<NodeId> = ids.iter().copied().collect();
    for edge in &edges {
        for endpoint in [edge.source, edge.target] {
            if !id_set.contains(&endpoint) {
                return Err(PipelineError::MissingNode(endpoint));
            }
        }
    }

    let pos: BTreeMap<NodeId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    // Phases are the components under non-buffered edges. Dependency
    // edges are always buffered, so only plain push/pull edges remain.
    let mut components = UnionFind::<usize>::new(ids.len());
    for edge in &edges {
        if !edge.buffered {
            components.union(pos[&edge.source], pos[&edge.target]);
        }
    }

    // Number the components by first appearance over ascending ids.
    let mut component_of: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut component_nodes: Vec<Vec<NodeId>> = Vec::new();
    for (i, &id) in ids.iter().enumerate() {
        let root = components.find_mut(i);
        let next = component_nodes.len();
        let component = *component_of.entry(ids[root]).or_insert(next);
        if component == component_nodes.len() {
            component_nodes.push(Vec::new());
        }
        component_nodes[component].push(id);
        component_of.insert(id, component);
    }

    // The phase graph: one edge per removed boundary edge, producer
    // phase → consumer phase.
    let count = component_nodes.len();
    let mut in_degree = vec![0usize; count];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
    for edge in &edges {
        if !edge.buffered {
            continue;
        }
        let (producer, consumer) = edge.producer_consumer();
        let from = component_of[&producer];
        let to = component_of[&consumer];
        if from == to {
            // A buffered edge whose endpoints ended up in the same phase
            // cannot be ordered producer-first.
            return Err(PipelineError::CyclicPhases);
        }
        successors[from].push(to);
        in_degree[to] += 1;
    }

    let mut ready: BinaryHeap<Reverse<(NodeId, usize)>> = (0..count)
        .filter(|&c| in_degree[c] == 0)
        .map(|c| Reverse((component_nodes[c][0], c)))
        .collect();
    let mut component_order = Vec::with_capacity(count);
    while let Some(Reverse((_, component))) = ready.pop() {
        component_order.push(component);
        for &succ in &successors[component] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.push(Reverse((component_nodes[succ][0], succ)));
            }
        }
    }
    if component_order.len() != count {
        return Err(PipelineError::CyclicPhases);
    }

    let item_flow = GraphView::item_flow(&ids, &edges)?;
    let actor = GraphView::actor(&ids, &edges, false)?;

    let mut phases = Vec::with_capacity(count);
    for (index, &component) in component_order.iter().enumerate() {
        let subset: BTreeSet<NodeId> = component_nodes[component].iter().copied().collect();
        let nodes = item_flow
            .topo_order_subset(&subset)
            .ok_or(PipelineError::CyclicItemFlow)?;
        let name = phase_name(map, &nodes, index)?;

        let sources = actor.sources_within(&subset);
        let &[initiator] = sources.as_slice() else {
            return Err(PipelineError::NoOrMultipleInitiators {
                phase: name,
                count: sources.len(),
            });
        };

        phases.push(Phase {
            name,
            nodes,
            initiator,
        });
    }

    Ok(PhasePlan { phases })
}

/// The display name of a phase: the highest-priority node name it
/// contains, ties to the lowest token id.
fn phase_name(map: &NodeMap, nodes: &[NodeId], index: usize) -> Result<String, PipelineError> {
    let mut best: Option<(NamePriority, NodeId, String)> = None;
    for &id in nodes {
        let node = map.node(id)?;
        let node = node.lock().unwrap();
        let parameters = node.base().parameters();
        let Some(name) = parameters.name.clone() else {
            continue;
        };
        let better = match &best {
            None => true,
            Some((priority, best_id, _)) => {
                parameters.name_priority > *priority
                    || (parameters.name_priority == *priority && id < *best_id)
            }
        };
        if better {
            best = Some((parameters.name_priority, id, name));
        }
    }
    Ok(best
        .map(|(_, _, name)| name)
        .unwrap_or_else(|| format!("phase {}", index + 1)))
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::core::NamePriority;
    use crate::node::{Node, NodeBase, NodeRef};
    use crate::token::Token;

    struct Plain {
        base: NodeBase,
    }

    impl Node for Plain {
        fn base(&self) -> &NodeBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut NodeBase {
            &mut self.base
        }
    }

    /// Registers plain nodes for the given tokens and keeps them alive.
    fn register(tokens: &[&Token]) -> Vec<NodeRef> {
        tokens
            .iter()
            .map(|token| {
                let node = Plain {
                    base: NodeBase::with_token((*token).clone()),
                };
                let slot: NodeRef = Arc::new(Mutex::new(node));
                token.map().register(token.id(), Arc::downgrade(&slot));
                slot
            })
            .collect()
    }

    #[test]
    fn test_linear_pipeline_is_one_phase() {
        let a = Token::new();
        let b = Token::new();
        let c = Token::new();
        let _alive = register(&[&a, &b, &c]);

        NodeMap::relate(&a, &b, crate::token::Relation::Push, false);
        NodeMap::relate(&b, &c, crate::token::Relation::Push, false);

        let plan = plan(&a.map()).unwrap();
        assert_eq!(plan.phases().len(), 1);

        let phase = &plan.phases()[0];
        assert_eq!(phase.nodes(), &[a.id(), b.id(), c.id()]);
        assert_eq!(phase.initiator(), a.id());
    }

    #[test]
    fn test_buffered_edge_splits_phases() {
        let a = Token::new();
        let b = Token::new();
        let c = Token::new();
        let _alive = register(&[&a, &b, &c]);

        NodeMap::relate(&a, &b, crate::token::Relation::Push, false);
        NodeMap::relate(&b, &c, crate::token::Relation::Push, true);

        let plan = plan(&a.map()).unwrap();
        assert_eq!(plan.phases().len(), 2);
        assert_eq!(plan.phases()[0].nodes(), &[a.id(), b.id()]);
        assert_eq!(plan.phases()[1].nodes(), &[c.id()]);
        assert_eq!(plan.phases()[1].initiator(), c.id());
    }

    #[test]
    fn test_every_node_is_in_exactly_one_phase() {
        let a = Token::new();
        let b = Token::new();
        let c = Token::new();
        let _alive = register(&[&a, &b, &c]);

        NodeMap::relate(&a, &b, crate::token::Relation::Push, false);
        NodeMap::relate(&b, &c, crate::token::Relation::Push, true);

        let plan = plan(&a.map()).unwrap();
        for token in [&a, &b, &c] {
            let owners = plan
                .phases()
                .iter()
                .filter(|phase| phase.nodes().contains(&token.id()))
                .count();
            assert_eq!(owners, 1);
        }
    }

    #[test]
    fn test_cyclic_dependencies_are_rejected() {
        let a = Token::new();
        let b = Token::new();
        let _alive = register(&[&a, &b]);

        NodeMap::relate(&a, &b, crate::token::Relation::Dependency, false);
        NodeMap::relate(&b, &a, crate::token::Relation::Dependency, false);

        let err = plan(&a.map()).err().unwrap();
        assert!(matches!(err, PipelineError::CyclicPhases));
    }

    #[test]
    fn test_two_initiators_are_rejected() {
        let a = Token::new();
        let b = Token::new();
        let c = Token::new();
        let _alive = register(&[&a, &b, &c]);

        NodeMap::relate(&a, &c, crate::token::Relation::Push, false);
        NodeMap::relate(&b, &c, crate::token::Relation::Push, false);

        let err = plan(&a.map()).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::NoOrMultipleInitiators { count: 2, .. }
        ));
    }

    #[test]
    fn test_zero_initiators_are_rejected() {
        let a = Token::new();
        let b = Token::new();
        let _alive = register(&[&a, &b]);

        // a pushes to b while b pulls from a: both have an incoming actor
        // edge, yet the item flow (a → b twice) stays acyclic.
        NodeMap::relate(&a, &b, crate::token::Relation::Push, false);
        NodeMap::relate(&b, &a, crate::token::Relation::Pull, false);

        let err = plan(&a.map()).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::NoOrMultipleInitiators { count: 0, .. }
        ));
    }

    #[test]
    fn test_item_flow_cycle_is_rejected() {
        let a = Token::new();
        let b = Token::new();
        let _alive = register(&[&a, &b]);

        NodeMap::relate(&a, &b, crate::token::Relation::Push, false);
        NodeMap::relate(&b, &a, crate::token::Relation::Push, false);

        let err = plan(&a.map()).err().unwrap();
        assert!(matches!(err, PipelineError::CyclicItemFlow));
    }

    #[test]
    fn test_buffered_edge_inside_one_phase_is_rejected() {
        let a = Token::new();
        let b = Token::new();
        let _alive = register(&[&a, &b]);

        NodeMap::relate(&a, &b, crate::token::Relation::Push, false);
        NodeMap::relate(&a, &b, crate::token::Relation::Push, true);

        let err = plan(&a.map()).err().unwrap();
        assert!(matches!(err, PipelineError::CyclicPhases));
    }

    #[test]
    fn test_replanning_yields_identical_plan() {
        let a = Token::new();
        let b = Token::new();
        let c = Token::new();
        let d = Token::new();
        let _alive = register(&[&a, &b, &c, &d]);

        NodeMap::relate(&a, &b, crate::token::Relation::Push, false);
        NodeMap::relate(&a, &c, crate::token::Relation::Push, false);
        NodeMap::relate(&b, &d, crate::token::Relation::Push, true);
        NodeMap::relate(&c, &d, crate::token::Relation::Push, true);

        let first = plan(&a.map()).unwrap();
        let second = plan(&a.map()).unwrap();

        assert_eq!(first.phases().len(), second.phases().len());
        for (left, right) in first.phases().iter().zip(second.phases()) {
            assert_eq!(left.nodes(), right.nodes());
            assert_eq!(left.initiator(), right.initiator());
            assert_eq!(left.name(), right.name());
        }
    }

    #[test]
    fn test_phase_name_prefers_higher_priority() {
        let a = Token::new();
        let b = Token::new();
        let alive = register(&[&a, &b]);

        alive[0]
            .lock()
            .unwrap()
            .base_mut()
            .set_name("hinted", NamePriority::Hint);
        alive[1]
            .lock()
            .unwrap()
            .base_mut()
            .set_name("chosen by user", NamePriority::User);

        NodeMap::relate(&a, &b, crate::token::Relation::Push, false);

        let plan = plan(&a.map()).unwrap();
        assert_eq!(plan.phases()[0].name(), "chosen by user");
    }

    #[test]
    fn test_disconnected_components_become_phases() {
        let a = Token::new();
        let b = Token::new();
        let _alive = register(&[&a, &b]);
        a.map().link(&b.map());

        let plan = plan(&a.map()).unwrap();
        assert_eq!(plan.phases().len(), 2);
        assert_eq!(plan.phases()[0].nodes(), &[a.id()]);
        assert_eq!(plan.phases()[1].nodes(), &[b.id()]);
    }
}
