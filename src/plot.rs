//! Graph export for debugging and documentation.
//!
//! Renders the node graph of a pipeline to Graphviz DOT or to structured
//! JSON. Nodes flagged [`PlotOptions::SIMPLIFIED_HIDE`] are omitted along
//! with their edges; buffered nodes and edges get a distinct style.

use std::collections::BTreeSet;
use std::fmt::Write;

use serde::Serialize;

use crate::executor::Pipeline;
use crate::node::PlotOptions;
use crate::token::Relation;

#[derive(Debug, Default, Serialize)]
pub struct GraphExport {
    pub nodes: Vec<NodeExport>,
    pub edges: Vec<EdgeExport>,
}

#[derive(Debug, Serialize)]
pub struct NodeExport {
    pub id: u64,
    pub name: String,
    pub buffered: bool,
}

#[derive(Debug, Serialize)]
pub struct EdgeExport {
    pub source: u64,
    pub target: u64,
    pub kind: &'static str,
    pub buffered: bool,
}

/// Collects the visible nodes and edges of a pipeline.
pub fn export(pipeline: &Pipeline) -> GraphExport {
    let Some(map) = pipeline.node_map() else {
        return GraphExport::default();
    };

    let mut hidden = BTreeSet::new();
    let mut nodes = Vec::new();
    for (id, slot) in pipeline.node_refs() {
        let node = slot.lock().unwrap();
        let options = node.base().plot_options();
        if options.contains(PlotOptions::SIMPLIFIED_HIDE) {
            hidden.insert(*id);
            continue;
        }
        nodes.push(NodeExport {
            id: id.get(),
            name: node.base().name(),
            buffered: options.contains(PlotOptions::BUFFERED),
        });
    }

    let known: BTreeSet<u64> = pipeline.node_refs().keys().map(|id| id.get()).collect();
    let mut edges = Vec::new();
    for edge in map.relations() {
        if hidden.contains(&edge.source) || hidden.contains(&edge.target) {
            continue;
        }
        if !known.contains(&edge.source.get()) || !known.contains(&edge.target.get()) {
            continue;
        }
        edges.push(EdgeExport {
            source: edge.source.get(),
            target: edge.target.get(),
            kind: match edge.relation {
                Relation::Push => "push",
                Relation::Pull => "pull",
                Relation::Dependency => "dependency",
            },
            buffered: edge.buffered,
        });
    }

    GraphExport { nodes, edges }
}

/// Renders the pipeline graph in Graphviz DOT format.
pub fn render_dot(pipeline: &Pipeline) -> String {
    let export = export(pipeline);
    let mut out = String::new();

    writeln!(out, "digraph pipeline {{").unwrap();
    writeln!(out, "    rankdir=LR;").unwrap();
    writeln!(out, "    node [shape=box];").unwrap();

    for node in &export.nodes {
        let name = node.name.replace('"', "\\\"");
        let extra = if node.buffered { ", peripheries=2" } else { "" };
        writeln!(out, "    n{} [label=\"{}\"{}];", node.id, name, extra).unwrap();
    }

    for edge in &export.edges {
        let style = match (edge.kind, edge.buffered) {
            ("dependency", _) => " [style=dotted]",
            (_, true) => " [style=bold]",
            ("pull", false) => " [style=dashed]",
            _ => "",
        };
        writeln!(out, "    n{} -> n{}{};", edge.source, edge.target, style).unwrap();
    }

    writeln!(out, "}}").unwrap();
    out
}

/// Renders the pipeline graph as pretty-printed JSON.
pub fn render_json(pipeline: &Pipeline) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&export(pipeline))
}
