//! Derived graph projections over the declared relations.
//!
//! Three views share the same node set: the *actor* graph (who calls whom:
//! push and pull edges, caller first), the *item-flow* graph (the
//! direction items travel: push edges plus reversed pull edges) and the
//! implicit dependency relation handled by the phase planner. All
//! topological orders break ties by ascending token id so that planning
//! and execution are reproducible.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::NodeId;
use crate::error::PipelineError;
use crate::token::{Edge, Relation};

pub(crate) struct GraphView {
    graph: DiGraph<NodeId, ()>,
    index: BTreeMap<NodeId, NodeIndex>,
}

impl GraphView {
    fn with_nodes(ids: &[NodeId]) -> Self {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();
        for &id in ids {
            index.insert(id, graph.add_node(id));
        }
        Self { graph, index }
    }

    fn insert_edge(&mut self, source: NodeId, target: NodeId) -> Result<(), PipelineError> {
        let &source_ix = self
            .index
            .get(&source)
            .ok_or(PipelineError::MissingNode(source))?;
        let &target_ix = self
            .index
            .get(&target)
            .ok_or(PipelineError::MissingNode(target))?;
        self.graph.add_edge(source_ix, target_ix, ());
        Ok(())
    }

    /// The actor projection: push and pull edges, caller → callee.
    /// Dependency edges are not actor edges. Buffered edges are phase
    /// boundaries and can be excluded.
    pub fn actor(
        ids: &[NodeId],
        edges: &[Edge],
        include_buffered: bool,
    ) -> Result<Self, PipelineError> {
        let mut view = Self::with_nodes(ids);
        for edge in edges {
            match edge.relation {
                Relation::Push | Relation::Pull => {
                    if edge.buffered && !include_buffered {
                        continue;
                    }
                    view.insert_edge(edge.source, edge.target)?;
                }
                Relation::Dependency => {}
            }
        }
        Ok(view)
    }

    /// The item-flow projection: producer → consumer. Push edges keep
    /// their direction, pull edges are reversed.
    pub fn item_flow(ids: &[NodeId], edges: &[Edge]) -> Result<Self, PipelineError> {
        let mut view = Self::with_nodes(ids);
        for edge in edges {
            let (source, target) = match edge.relation {
                Relation::Push => (edge.source, edge.target),
                Relation::Pull => (edge.target, edge.source),
                Relation::Dependency => continue,
            };
            view.insert_edge(source, target)?;
        }
        Ok(view)
    }

    /// Direct successors of `id`, ascending and deduplicated.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let Some(&ix) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut out: Vec<NodeId> = self
            .graph
            .neighbors_directed(ix, Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Topological order over all nodes, `None` on a cycle.
    pub fn topo_order(&self) -> Option<Vec<NodeId>> {
        let subset: BTreeSet<NodeId> = self.index.keys().copied().collect();
        self.topo_order_subset(&subset)
    }

    /// Kahn's algorithm restricted to the edges with both endpoints in
    /// `subset`; ready nodes are taken by ascending id. Returns `None`
    /// when the restricted graph has a cycle.
    pub fn topo_order_subset(&self, subset: &BTreeSet<NodeId>) -> Option<Vec<NodeId>> {
        let mut in_degree: BTreeMap<NodeId, usize> =
            subset.iter().map(|&id| (id, 0usize)).collect();

        for edge_ix in self.graph.edge_indices() {
            let (source_ix, target_ix) = self.graph.edge_endpoints(edge_ix).unwrap();
            let source = self.graph[source_ix];
            let target = self.graph[target_ix];
            if subset.contains(&source) && subset.contains(&target) {
                *in_degree.get_mut(&target).unwrap() += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&id, _)| Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(subset.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            let Some(&ix) = self.index.get(&id) else {
                continue;
            };
            for succ_ix in self.graph.neighbors_directed(ix, Direction::Outgoing) {
                let succ = self.graph[succ_ix];
                if !subset.contains(&succ) {
                    continue;
                }
                let degree = in_degree.get_mut(&succ).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }

        (order.len() == subset.len()).then_some(order)
    }

    /// Nodes of `subset` without incoming edges from within `subset`.
    pub fn sources_within(&self, subset: &BTreeSet<NodeId>) -> Vec<NodeId> {
        subset
            .iter()
            .copied()
            .filter(|id| {
                let Some(&ix) = self.index.get(id) else {
                    return true;
                };
                !self
                    .graph
                    .neighbors_directed(ix, Direction::Incoming)
                    .any(|p| subset.contains(&self.graph[p]))
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::token::Token;

    fn ids(n: usize) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = (0..n).map(|_| Token::new().id()).collect();
        out.sort_unstable();
        out
    }

    fn push(source: NodeId, target: NodeId) -> Edge {
        Edge {
            source,
            target,
            relation: Relation::Push,
            buffered: false,
        }
    }

    fn pull(source: NodeId, target: NodeId) -> Edge {
        Edge {
            source,
            target,
            relation: Relation::Pull,
            buffered: false,
        }
    }

    #[test]
    fn test_item_flow_reverses_pull_edges() {
        let ids = ids(2);
        // ids[0] pulls from ids[1]: items flow 1 → 0.
        let view = GraphView::item_flow(&ids, &[pull(ids[0], ids[1])]).unwrap();
        assert_eq!(view.successors(ids[1]), vec![ids[0]]);
        assert!(view.successors(ids[0]).is_empty());
    }

    #[test]
    fn test_actor_keeps_pull_direction() {
        let ids = ids(2);
        let view = GraphView::actor(&ids, &[pull(ids[0], ids[1])], true).unwrap();
        assert_eq!(view.successors(ids[0]), vec![ids[1]]);
    }

    #[test]
    fn test_topo_order_breaks_ties_by_id() {
        let ids = ids(4);
        // One root (ids[3]) feeding the three others; the successors are
        // otherwise unordered and must come out ascending.
        let edges = [
            push(ids[3], ids[2]),
            push(ids[3], ids[0]),
            push(ids[3], ids[1]),
        ];
        let view = GraphView::item_flow(&ids, &edges).unwrap();
        let order = view.topo_order().unwrap();
        assert_eq!(order, vec![ids[3], ids[0], ids[1], ids[2]]);
    }

    #[test]
    fn test_topo_order_detects_cycles() {
        let ids = ids(2);
        let edges = [push(ids[0], ids[1]), push(ids[1], ids[0])];
        let view = GraphView::item_flow(&ids, &edges).unwrap();
        assert!(view.topo_order().is_none());
    }

    #[test]
    fn test_topo_order_subset_ignores_outside_edges() {
        let ids = ids(3);
        let edges = [push(ids[0], ids[1]), push(ids[2], ids[0])];
        let view = GraphView::item_flow(&ids, &edges).unwrap();

        let subset: BTreeSet<NodeId> = [ids[0], ids[1]].into_iter().collect();
        let order = view.topo_order_subset(&subset).unwrap();
        assert_eq!(order, vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_sources_within() {
        let ids = ids(3);
        let edges = [push(ids[0], ids[1]), push(ids[1], ids[2])];
        let view = GraphView::actor(&ids, &edges, false).unwrap();

        let all: BTreeSet<NodeId> = ids.iter().copied().collect();
        assert_eq!(view.sources_within(&all), vec![ids[0]]);
    }

    #[test]
    fn test_edge_with_unknown_endpoint_fails() {
        let ids = ids(1);
        let stranger = Token::new();
        let err = GraphView::item_flow(&ids, &[push(ids[0], stranger.id())])
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::MissingNode(_)));
    }

    #[test]
    fn test_replanning_is_deterministic() {
        let ids = ids(5);
        let edges = [
            push(ids[0], ids[2]),
            push(ids[0], ids[1]),
            push(ids[1], ids[4]),
            push(ids[2], ids[4]),
            push(ids[0], ids[3]),
        ];
        let view = GraphView::item_flow(&ids, &edges).unwrap();
        let first = view.topo_order().unwrap();
        let second = view.topo_order().unwrap();
        assert_eq!(first, second);
    }
}
