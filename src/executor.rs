//! The lifecycle executor.
//!
//! A [`Pipeline`] owns its nodes and drives every planned phase through
//! `prepare → propagate → begin → go → end → evacuate`, strictly one
//! phase after another on a single thread. Metadata forwarding is flushed
//! hop-by-hop after each `prepare` and `propagate` hook; memory is
//! assigned between the two; the unique phase initiator receives `go`.
//! State transitions are asserted — a hook invoked out of order aborts
//! the run with a lifecycle violation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, info_span};

use crate::core::{MemorySize, NodeId};
use crate::error::PipelineError;
use crate::graph::GraphView;
use crate::memory::{self, Consumer, ConsumerKey};
use crate::node::{Node, NodeRef, State};
use crate::phase::{self, Phase, PhasePlan};
use crate::progress::{NullProgress, Progress, StepOverflow};
use crate::token::{NodeMap, Token};

/// Summary of one executed phase.
#[derive(Debug)]
pub struct PhaseReport {
    pub name: String,
    /// Nodes in execution (item-flow topological) order.
    pub nodes: Vec<NodeId>,
    pub assigned_memory: Vec<(NodeId, MemorySize)>,
    pub datastructure_memory: Vec<(String, MemorySize)>,
    pub step_overflows: Vec<StepOverflow>,
    pub evacuated: Vec<NodeId>,
    pub elapsed: Duration,
}

/// Summary of a whole pipeline run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub phases: Vec<PhaseReport>,
}

impl RunReport {
    /// All step overflow diagnostics across phases.
    pub fn step_overflows(&self) -> impl Iterator<Item = &StepOverflow> {
        self.phases.iter().flat_map(|phase| phase.step_overflows.iter())
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Prepare,
    Propagate,
    Begin,
    Go,
    End,
    Evacuate,
}

#[derive(Default)]
struct Assignment {
    nodes: Vec<(NodeId, MemorySize)>,
    datastructures: Vec<(String, MemorySize)>,
}

/// Calls `done()` on the indicator when the phase scope is left, on all
/// exit paths.
struct DoneGuard(Arc<dyn Progress>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Owns a set of nodes and executes them phase by phase.
///
/// Nodes are wired to each other through their tokens before being added;
/// adding links every node into one shared [`NodeMap`]. After a phase has
/// ended (and evacuated, where needed) its nodes are destroyed.
pub struct Pipeline {
    map: Option<NodeMap>,
    nodes: BTreeMap<NodeId, NodeRef>,
    progress: Arc<dyn Progress>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            map: None,
            nodes: BTreeMap::new(),
            progress: Arc::new(NullProgress),
        }
    }

    /// Uses `progress` as the phase-level indicator. It is initialized
    /// with the declared step total of each phase in turn.
    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Adds a node, registering it under its token. Returns the token so
    /// that later nodes can be wired to this one.
    pub fn add<N: Node + 'static>(&mut self, node: N) -> Token {
        let token = node.base().token().clone();
        let slot: NodeRef = Arc::new(Mutex::new(node));
        token.map().register(token.id(), Arc::downgrade(&slot));
        match &self.map {
            None => self.map = Some(token.map()),
            Some(map) => map.link(&token.map()),
        }
        self.nodes.insert(token.id(), slot);
        token
    }

    /// Computes the phase partition without executing anything.
    pub fn plan(&self) -> Result<PhasePlan, PipelineError> {
        match &self.map {
            None => Ok(PhasePlan { phases: Vec::new() }),
            Some(map) => phase::plan(&map.find()),
        }
    }

    /// Executes all phases against the given memory budget.
    pub fn run(&mut self, memory: MemorySize) -> Result<RunReport, PipelineError> {
        let Some(map) = self.map.clone() else {
            return Ok(RunReport::default());
        };
        let map = map.find();
        let plan = phase::plan(&map)?;

        let started = Instant::now();
        let mut report = RunReport::default();
        for phase in plan.phases() {
            self.run_phase(&map, phase, memory, &mut report)?;

            // The phase is complete; its nodes are destroyed.
            for &id in phase.nodes() {
                self.nodes.remove(&id);
                map.forget(id);
            }
        }
        info!(
            "pipeline finished: {} phases {}",
            report.phases.len(),
            crate::utils::fmt_elapsed(started.elapsed())
        );
        Ok(report)
    }

    pub(crate) fn node_map(&self) -> Option<NodeMap> {
        self.map.as_ref().map(NodeMap::find)
    }

    pub(crate) fn node_refs(&self) -> &BTreeMap<NodeId, NodeRef> {
        &self.nodes
    }

    fn run_phase(
        &self,
        map: &NodeMap,
        phase: &Phase,
        budget: MemorySize,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let span = info_span!("phase", name = %phase.name());
        let _enter = span.enter();
        info!(
            "phase '{}': {} nodes, initiator '{}'",
            phase.name(),
            phase.nodes().len(),
            phase.initiator()
        );
        let phase_started = Instant::now();

        for &id in phase.nodes() {
            self.invoke(map, id, Hook::Prepare)?;
            self.flush_forwards(map, id)?;
        }

        let assignment = self.assign_memory(map, phase, budget)?;

        for &id in phase.nodes() {
            self.invoke(map, id, Hook::Propagate)?;
            self.flush_forwards(map, id)?;
        }

        // Step budgets are declared by now; wire up the phase indicator.
        let mut total_steps = 0u64;
        for &id in phase.nodes() {
            let node = map.node(id)?;
            let node = node.lock().unwrap();
            total_steps = total_steps.saturating_add(node.base().steps_total());
            node.base()
                .step_tracker()
                .attach(node.base().name(), self.progress.clone());
        }
        self.progress.init(total_steps);
        let _done = DoneGuard(self.progress.clone());

        for &id in phase.nodes().iter().rev() {
            self.invoke(map, id, Hook::Begin)?;
        }

        self.invoke(map, phase.initiator(), Hook::Go)?;

        for &id in phase.nodes() {
            self.invoke(map, id, Hook::End)?;
        }

        let evacuated = self.evacuate_phase(map, phase)?;

        let mut step_overflows = Vec::new();
        for &id in phase.nodes() {
            let node = map.node(id)?;
            let tracker = node.lock().unwrap().base().step_tracker();
            step_overflows.extend(tracker.take_overflows());
        }

        let elapsed = phase_started.elapsed();
        info!("phase '{}' done {}", phase.name(), crate::utils::fmt_elapsed(elapsed));

        report.phases.push(PhaseReport {
            name: phase.name().to_string(),
            nodes: phase.nodes().to_vec(),
            assigned_memory: assignment.nodes,
            datastructure_memory: assignment.datastructures,
            step_overflows,
            evacuated,
            elapsed,
        });
        Ok(())
    }

    fn invoke(&self, map: &NodeMap, id: NodeId, hook: Hook) -> Result<(), PipelineError> {
        let node = map.node(id)?;
        let mut node = node.lock().unwrap();

        let (expected, during, after) = match hook {
            Hook::Prepare => (State::Fresh, Some(State::InPrepare), State::AfterPrepare),
            Hook::Propagate => (
                State::AfterPrepare,
                Some(State::InPropagate),
                State::AfterPropagate,
            ),
            Hook::Begin => (State::AfterPropagate, Some(State::InBegin), State::AfterBegin),
            Hook::Go => (State::AfterBegin, None, State::AfterBegin),
            Hook::End => (State::AfterBegin, Some(State::InEnd), State::AfterEnd),
            Hook::Evacuate => (State::AfterEnd, None, State::AfterEnd),
        };

        let found = node.base().state();
        if found != expected {
            return Err(PipelineError::Lifecycle {
                node: node.base().name(),
                expected,
                found,
            });
        }
        if let Some(during) = during {
            node.base_mut().set_state(during);
        }

        let result = match hook {
            Hook::Prepare => node.prepare(),
            Hook::Propagate => node.propagate(),
            Hook::Begin => node.begin(),
            Hook::Go => node.go(),
            Hook::End => node.end(),
            Hook::Evacuate => node.evacuate(),
        };
        node.base_mut().set_state(after);

        result.map_err(|source| wrap_hook_error(node.base().name(), source))
    }

    /// Pushes the node's value table to its item-flow successors. Running
    /// this after every hook in topological order makes the propagation
    /// transitive across the whole graph, including phase boundaries.
    fn flush_forwards(&self, map: &NodeMap, id: NodeId) -> Result<(), PipelineError> {
        let ids = map.node_ids();
        let alive: BTreeSet<NodeId> = ids.iter().copied().collect();
        // Edges into already-destroyed phases stay behind in the map;
        // they can no longer carry values.
        let edges: Vec<_> = map
            .relations()
            .into_iter()
            .filter(|edge| alive.contains(&edge.source) && alive.contains(&edge.target))
            .collect();
        let item_flow = GraphView::item_flow(&ids, &edges)?;
        let successors = item_flow.successors(id);
        if successors.is_empty() {
            return Ok(());
        }

        let values = {
            let node = map.node(id)?;
            let node = node.lock().unwrap();
            node.base().forwarded_values().clone()
        };
        for successor in successors {
            let target = map.node(successor)?;
            let mut target = target.lock().unwrap();
            for (key, slot) in &values {
                let mut slot = slot.clone();
                slot.own = false;
                target.base_mut().write_slot(key.clone(), slot);
            }
        }
        Ok(())
    }

    fn assign_memory(
        &self,
        map: &NodeMap,
        phase: &Phase,
        budget: MemorySize,
    ) -> Result<Assignment, PipelineError> {
        let mut consumers = Vec::new();
        // Shared datastructures are one consumer per name, with the
        // bounds and priority folded over all requesting nodes of the
        // phase.
        let mut shared: BTreeMap<String, Consumer> = BTreeMap::new();
        for &id in phase.nodes() {
            let node = map.node(id)?;
            let node = node.lock().unwrap();
            let base = node.base();
            consumers.push(Consumer {
                key: ConsumerKey::Node(id),
                min: base.minimum_memory(),
                max: base.maximum_memory(),
                weight: base.memory_fraction(),
            });
            for (name, request) in base.datastructure_requests() {
                let entry = shared.entry(name.clone()).or_insert(Consumer {
                    key: ConsumerKey::Datastructure(name.clone()),
                    min: 0,
                    max: MemorySize::MAX,
                    weight: 0.0,
                });
                entry.min = entry.min.max(request.min);
                entry.max = entry.max.min(request.max);
                entry.weight = entry.weight.max(request.priority);
            }
        }
        consumers.extend(shared.into_values());
        consumers.sort_by(|a, b| a.key.cmp(&b.key));

        let mut assignment = Assignment::default();
        for (key, value) in memory::assign(&consumers, budget, phase.name())? {
            match key {
                ConsumerKey::Node(id) => {
                    let node = map.node(id)?;
                    let mut node = node.lock().unwrap();
                    node.base_mut().assign_memory(value);
                    node.memory_assigned(value);
                    assignment.nodes.push((id, value));
                }
                ConsumerKey::Datastructure(name) => {
                    map.assign_datastructure_memory(&name, value);
                    assignment.datastructures.push((name, value));
                }
            }
        }
        Ok(assignment)
    }

    /// Evacuates every evacuable node whose output is consumed across a
    /// phase boundary, in descending flush priority (ties by ascending
    /// token id).
    fn evacuate_phase(&self, map: &NodeMap, phase: &Phase) -> Result<Vec<NodeId>, PipelineError> {
        let edges = map.relations();
        let here: BTreeSet<NodeId> = phase.nodes().iter().copied().collect();

        let mut candidates: Vec<(MemorySize, NodeId)> = Vec::new();
        for &id in phase.nodes() {
            let node = map.node(id)?;
            let node = node.lock().unwrap();
            if !node.can_evacuate() {
                continue;
            }
            let buffers_onward = edges.iter().any(|edge| {
                if !edge.buffered {
                    return false;
                }
                let (producer, consumer) = edge.producer_consumer();
                producer == id && !here.contains(&consumer)
            });
            if buffers_onward {
                candidates.push((node.base().flush_priority(), id));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut evacuated = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            self.invoke(map, id, Hook::Evacuate)?;
            evacuated.push(id);
        }
        Ok(evacuated)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn wrap_hook_error(node: String, error: anyhow::Error) -> PipelineError {
    match error.downcast::<PipelineError>() {
        Ok(error) => error,
        Err(error) => PipelineError::Hook { node, error },
    }
}
