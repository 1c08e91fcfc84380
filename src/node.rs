//! The node contract: lifecycle hooks plus the embedded [`NodeBase`].
//!
//! Concrete nodes implement [`Node`] by embedding a [`NodeBase`] and
//! overriding the hooks they care about. Everything declarative — edges,
//! memory requests, step budgets, names, datastructure usage — goes
//! through the base, typically from the node's constructor or its
//! `prepare` hook.

use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::core::{Dynamic, MemorySize, NamePriority, NodeId, StepCount};
use crate::error::PipelineError;
use crate::progress::{Progress, ProxyProgress, StepTracker};
use crate::token::{NodeMap, Relation, Token};

pub(crate) type NodeRef = Arc<Mutex<dyn Node>>;
pub(crate) type WeakNodeRef = Weak<Mutex<dyn Node>>;

/// Lifecycle state of a node. Transitions are performed by the executor
/// only and advance monotonically through the declared order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Fresh,
    InPrepare,
    AfterPrepare,
    InPropagate,
    AfterPropagate,
    InBegin,
    AfterBegin,
    InEnd,
    AfterEnd,
}

/// Options for how to render a node when plotting the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlotOptions(u8);

impl PlotOptions {
    pub const NONE: PlotOptions = PlotOptions(0);
    /// Hide this node in simplified renderings.
    pub const SIMPLIFIED_HIDE: PlotOptions = PlotOptions(1);
    /// Mark this node as buffering its input.
    pub const BUFFERED: PlotOptions = PlotOptions(1 << 1);

    pub fn contains(self, other: PlotOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PlotOptions {
    type Output = PlotOptions;

    fn bitor(self, rhs: PlotOptions) -> PlotOptions {
        PlotOptions(self.0 | rhs.0)
    }
}

/// Declarative parameters of a node, filled in by the subclass before the
/// phase starts executing.
#[derive(Debug, Clone)]
pub struct NodeParameters {
    pub minimum_memory: MemorySize,
    pub maximum_memory: MemorySize,
    pub memory_fraction: f64,
    pub name: Option<String>,
    pub name_priority: NamePriority,
    pub steps_total: StepCount,
}

impl Default for NodeParameters {
    fn default() -> Self {
        Self {
            minimum_memory: 0,
            maximum_memory: MemorySize::MAX,
            memory_fraction: 0.0,
            name: None,
            name_priority: NamePriority::Default,
            steps_total: 0,
        }
    }
}

/// One forwarded value: the payload, its type name for diagnostics, the
/// explicit flag, and whether this node wrote it itself (as opposed to
/// having received it from upstream).
#[derive(Clone)]
pub(crate) struct ForwardSlot {
    pub value: Dynamic,
    pub type_name: &'static str,
    pub explicit: bool,
    pub own: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DatastructureRequest {
    pub min: MemorySize,
    pub max: MemorySize,
    pub priority: f64,
}

/// State shared by all nodes. Concrete nodes embed one and expose it via
/// [`Node::base`] / [`Node::base_mut`].
pub struct NodeBase {
    token: Token,
    parameters: NodeParameters,
    available_memory: MemorySize,
    values: BTreeMap<String, ForwardSlot>,
    datastructures: BTreeMap<String, DatastructureRequest>,
    steps: StepTracker,
    state: State,
    plot_options: PlotOptions,
    flush_priority: MemorySize,
}

impl NodeBase {
    /// Creates a base with a fresh token in its own map.
    pub fn new() -> Self {
        Self::with_token(Token::new())
    }

    /// Creates a base around a token handed in from outside, so that other
    /// nodes can be wired to this one before it is constructed.
    pub fn with_token(token: Token) -> Self {
        Self {
            token,
            parameters: NodeParameters::default(),
            available_memory: 0,
            values: BTreeMap::new(),
            datastructures: BTreeMap::new(),
            steps: StepTracker::new(),
            state: State::Fresh,
            plot_options: PlotOptions::NONE,
            flush_priority: 0,
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn id(&self) -> NodeId {
        self.token.id()
    }

    /// The map shared by all nodes reachable from this one.
    pub fn node_map(&self) -> NodeMap {
        self.token.map()
    }

    /// Display name: the set name, or a placeholder derived from the id.
    pub fn name(&self) -> String {
        self.parameters
            .name
            .clone()
            .unwrap_or_else(|| format!("node {}", self.id()))
    }

    pub fn parameters(&self) -> &NodeParameters {
        &self.parameters
    }

    /// Sets the node name. A lower priority than the stored one is
    /// ignored; equal or higher overwrites.
    pub fn set_name(&mut self, name: impl Into<String>, priority: NamePriority) {
        if priority >= self.parameters.name_priority {
            self.parameters.name = Some(name.into());
            self.parameters.name_priority = priority;
        }
    }

    /// Prepends a breadcrumb to the current name.
    pub fn set_breadcrumb(&mut self, breadcrumb: impl Into<String>) {
        let breadcrumb = breadcrumb.into();
        self.parameters.name = Some(match self.parameters.name.take() {
            None => breadcrumb,
            Some(name) => format!("{breadcrumb} | {name}"),
        });
    }

    // --- graph wiring -----------------------------------------------------

    /// Declares that this node pushes items to `dest`.
    pub fn add_push_destination(&mut self, dest: &Token) {
        NodeMap::relate(&self.token, dest, Relation::Push, false);
    }

    /// Declares a push destination behind a buffer: this node must end
    /// before `dest` begins, splitting the graph into separate phases.
    pub fn add_buffered_push_destination(&mut self, dest: &Token) {
        NodeMap::relate(&self.token, dest, Relation::Push, true);
        self.plot_options = self.plot_options | PlotOptions::BUFFERED;
    }

    /// Declares that this node pulls items from `source`.
    pub fn add_pull_source(&mut self, source: &Token) {
        NodeMap::relate(&self.token, source, Relation::Pull, false);
    }

    /// Declares a pull source behind a buffer: `source` must end before
    /// this node begins.
    pub fn add_buffered_pull_source(&mut self, source: &Token) {
        NodeMap::relate(&self.token, source, Relation::Pull, true);
    }

    /// Declares that `dest` must have ended before this node begins.
    pub fn add_dependency(&mut self, dest: &Token) {
        NodeMap::relate(&self.token, dest, Relation::Dependency, true);
    }

    // --- memory -----------------------------------------------------------

    pub fn set_minimum_memory(&mut self, minimum: MemorySize) {
        self.parameters.minimum_memory = minimum;
    }

    pub fn set_maximum_memory(&mut self, maximum: MemorySize) {
        self.parameters.maximum_memory = maximum;
    }

    /// Sets the weight used when splitting the phase budget. The weight
    /// must be finite and non-negative.
    pub fn set_memory_fraction(&mut self, fraction: f64) -> Result<(), PipelineError> {
        if !fraction.is_finite() || fraction < 0.0 {
            return Err(PipelineError::InvalidWeight {
                consumer: self.name(),
                weight: fraction,
            });
        }
        self.parameters.memory_fraction = fraction;
        Ok(())
    }

    pub fn minimum_memory(&self) -> MemorySize {
        self.parameters.minimum_memory
    }

    pub fn maximum_memory(&self) -> MemorySize {
        self.parameters.maximum_memory
    }

    pub fn memory_fraction(&self) -> f64 {
        self.parameters.memory_fraction
    }

    /// Memory assigned to this node for the current phase.
    pub fn available_memory(&self) -> MemorySize {
        self.available_memory
    }

    pub(crate) fn assign_memory(&mut self, available: MemorySize) {
        self.available_memory = available;
    }

    // --- metadata forwarding ----------------------------------------------

    /// Forwards a value under `key` to all item-flow successors. The value
    /// is explicit: it overrides implicit values downstream.
    pub fn forward<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.forward_with(key, value, true);
    }

    /// Forwards a value, choosing whether it is explicit. Implicit values
    /// never replace an explicit one already present downstream.
    pub fn forward_with<T: Any + Send + Sync>(
        &mut self,
        key: impl Into<String>,
        value: T,
        explicit: bool,
    ) {
        self.write_slot(
            key.into(),
            ForwardSlot {
                value: Arc::new(value),
                type_name: type_name::<T>(),
                explicit,
                own: true,
            },
        );
    }

    /// Applies the override rules for an incoming slot.
    ///
    /// A node's own explicit entry is a propagation sink: hop-propagated
    /// writes never replace it. Inherited entries follow explicit-beats-
    /// implicit; a node's own explicit forward always overwrites.
    pub(crate) fn write_slot(&mut self, key: String, incoming: ForwardSlot) {
        use std::collections::btree_map::Entry;

        match self.values.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(incoming);
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                let replace = if incoming.own {
                    incoming.explicit || !existing.explicit
                } else if existing.own && existing.explicit {
                    false
                } else {
                    incoming.explicit || !existing.explicit
                };
                if replace {
                    entry.insert(incoming);
                }
            }
        }
    }

    pub(crate) fn forwarded_values(&self) -> &BTreeMap<String, ForwardSlot> {
        &self.values
    }

    /// True if a value has been forwarded under `key`.
    pub fn can_fetch(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Fetches a forwarded value, cloning it out of the shared slot.
    pub fn fetch<T: Any + Clone>(&self, key: &str) -> Result<T, PipelineError> {
        let slot = self
            .values
            .get(key)
            .ok_or_else(|| PipelineError::MissingKey(key.to_string()))?;
        slot.value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| PipelineError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
                stored: slot.type_name,
            })
    }

    /// Fetches a forwarded value in its type-erased form.
    pub fn fetch_any(&self, key: &str) -> Result<Arc<dyn Any + Send + Sync>, PipelineError> {
        self.values
            .get(key)
            .map(|slot| slot.value.clone())
            .ok_or_else(|| PipelineError::MissingKey(key.to_string()))
    }

    // --- datastructures ---------------------------------------------------

    /// Registers usage of a named, shared datastructure. Multiple nodes
    /// registering the same name share one instance and one memory slot.
    /// The priority is the datastructure's memory weight and must be
    /// finite and non-negative.
    pub fn register_datastructure_usage(
        &mut self,
        name: impl Into<String>,
        priority: f64,
    ) -> Result<(), PipelineError> {
        let name = name.into();
        if !priority.is_finite() || priority < 0.0 {
            return Err(PipelineError::InvalidWeight {
                consumer: name,
                weight: priority,
            });
        }
        self.node_map().register_datastructure(&name);
        self.datastructures
            .entry(name)
            .and_modify(|request| request.priority = request.priority.max(priority))
            .or_insert(DatastructureRequest {
                min: 0,
                max: MemorySize::MAX,
                priority,
            });
        Ok(())
    }

    /// Declares memory bounds for a registered datastructure. Repeated
    /// calls fold: the maximum of the minimums, the minimum of the
    /// maximums. The memory runtime folds the bounds once more across all
    /// nodes of a phase that request the same name.
    pub fn set_datastructure_memory_limits(
        &mut self,
        name: &str,
        min: MemorySize,
        max: MemorySize,
    ) -> Result<(), PipelineError> {
        let request = self
            .datastructures
            .get_mut(name)
            .ok_or_else(|| PipelineError::UnregisteredDatastructure(name.to_string()))?;
        request.min = request.min.max(min);
        request.max = request.max.min(max);
        Ok(())
    }

    /// Stores the shared datastructure value for `name`.
    pub fn set_datastructure<T: Any + Send + Sync>(
        &self,
        name: &str,
        value: T,
    ) -> Result<(), PipelineError> {
        self.node_map()
            .set_datastructure_value(name, Arc::new(value), type_name::<T>())
    }

    /// Retrieves the shared datastructure value for `name`.
    pub fn get_datastructure<T: Any + Send + Sync>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, PipelineError> {
        let (value, stored) = self.node_map().datastructure_value(name)?;
        value
            .downcast::<T>()
            .map_err(|_| PipelineError::TypeMismatch {
                key: name.to_string(),
                expected: type_name::<T>(),
                stored,
            })
    }

    /// Memory assigned to a registered datastructure for the current phase.
    pub fn get_datastructure_memory(&self, name: &str) -> Result<MemorySize, PipelineError> {
        self.node_map().datastructure_assigned(name)
    }

    pub(crate) fn datastructure_requests(&self) -> &BTreeMap<String, DatastructureRequest> {
        &self.datastructures
    }

    // --- progress ---------------------------------------------------------

    /// Declares how many times [`NodeBase::step`] will be called at most
    /// during this phase.
    pub fn set_steps(&mut self, steps: StepCount) {
        self.parameters.steps_total = steps;
        let name = self.name();
        self.steps.configure(name, steps);
    }

    pub fn steps_total(&self) -> StepCount {
        self.parameters.steps_total
    }

    pub fn steps_left(&self) -> StepCount {
        self.steps.left()
    }

    /// Charges `steps` against the declared budget and forwards them to
    /// the phase progress indicator. Charging more than the remaining
    /// budget records one overflow diagnostic and clamps to zero; the
    /// phase keeps running.
    pub fn step(&mut self, steps: StepCount) {
        debug_assert!(
            matches!(self.state, State::InBegin | State::AfterBegin | State::InEnd),
            "step() outside of begin/go/end"
        );
        self.steps.step(steps);
    }

    /// Returns a progress indicator that rescales external sub-progress
    /// into this node's declared step budget.
    pub fn proxy_progress_indicator(&self) -> Arc<dyn Progress> {
        Arc::new(ProxyProgress::new(self.steps.clone()))
    }

    pub(crate) fn step_tracker(&self) -> StepTracker {
        self.steps.clone()
    }

    // --- lifecycle / misc -------------------------------------------------

    pub fn state(&self) -> State {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn plot_options(&self) -> PlotOptions {
        self.plot_options
    }

    pub fn set_plot_options(&mut self, options: PlotOptions) {
        self.plot_options = options;
    }

    pub fn flush_priority(&self) -> MemorySize {
        self.flush_priority
    }

    pub fn set_flush_priority(&mut self, priority: MemorySize) {
        self.flush_priority = priority;
    }
}

impl Default for NodeBase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBase")
            .field("id", &self.id())
            .field("name", &self.parameters.name)
            .field("state", &self.state)
            .finish()
    }
}

/// A dataflow unit driven through the phase lifecycle by the executor.
///
/// All hooks default to no-ops except [`Node::go`], which fails on nodes
/// that are not initiators. Hook errors are userland errors (`anyhow`);
/// the executor wraps them with the node name and aborts the phase.
pub trait Node: Send {
    fn base(&self) -> &NodeBase;

    fn base_mut(&mut self) -> &mut NodeBase;

    /// Called after depending phases have ended, before memory assignment.
    /// May fetch and forward.
    fn prepare(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after memory assignment, in item-flow topological order.
    /// May fetch and forward stream metadata.
    fn propagate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called in reverse item-flow topological order, before items move.
    /// May push and pull.
    fn begin(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Executes the phase by pushing all items. Called on the phase
    /// initiator only; the default implementation fails.
    fn go(&mut self) -> anyhow::Result<()> {
        let name = self.base().name();
        tracing::warn!("node '{name}' is not an initiator node");
        Err(PipelineError::NotInitiator(name).into())
    }

    /// Called in item-flow topological order, after items have moved.
    /// May push and pull remaining items.
    fn end(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked after the phase budget has been split; `available` has
    /// already been stored on the base.
    fn memory_assigned(&mut self, _available: MemorySize) {}

    /// True if this node can spill its data to external storage.
    fn can_evacuate(&self) -> bool {
        false
    }

    /// Spills data so that memory can be reused by the next phase. Called
    /// after `end` when a later phase still needs this node's output.
    fn evacuate(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_explicit_forward_is_sticky() {
        let mut base = NodeBase::new();
        base.forward("n_items", 100u64);
        base.forward_with("n_items", 50u64, false);
        assert_eq!(base.fetch::<u64>("n_items").unwrap(), 100);
    }

    #[test]
    fn test_own_explicit_forward_overwrites() {
        let mut base = NodeBase::new();
        base.forward("n_items", 100u64);
        base.forward("n_items", 25u64);
        assert_eq!(base.fetch::<u64>("n_items").unwrap(), 25);
    }

    #[test]
    fn test_inherited_write_never_replaces_own_explicit() {
        let mut base = NodeBase::new();
        base.forward("n_items", 50u64);
        base.write_slot(
            "n_items".to_string(),
            ForwardSlot {
                value: Arc::new(100u64),
                type_name: type_name::<u64>(),
                explicit: true,
                own: false,
            },
        );
        assert_eq!(base.fetch::<u64>("n_items").unwrap(), 50);
    }

    #[test]
    fn test_inherited_explicit_replaces_inherited_implicit() {
        let mut base = NodeBase::new();
        base.write_slot(
            "n_items".to_string(),
            ForwardSlot {
                value: Arc::new(1u64),
                type_name: type_name::<u64>(),
                explicit: false,
                own: false,
            },
        );
        base.write_slot(
            "n_items".to_string(),
            ForwardSlot {
                value: Arc::new(2u64),
                type_name: type_name::<u64>(),
                explicit: true,
                own: false,
            },
        );
        assert_eq!(base.fetch::<u64>("n_items").unwrap(), 2);
    }

    #[test]
    fn test_fetch_missing_key() {
        let base = NodeBase::new();
        assert!(!base.can_fetch("nope"));
        assert!(matches!(
            base.fetch::<u64>("nope"),
            Err(PipelineError::MissingKey(_))
        ));
    }

    #[test]
    fn test_fetch_wrong_type() {
        let mut base = NodeBase::new();
        base.forward("n_items", 100u64);
        let err = base.fetch::<String>("n_items").err().unwrap();
        assert!(matches!(err, PipelineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_name_priority_rules() {
        let mut base = NodeBase::new();
        base.set_name("from user", NamePriority::User);
        base.set_name("from hint", NamePriority::Hint);
        assert_eq!(base.name(), "from user");

        base.set_name("another user name", NamePriority::User);
        assert_eq!(base.name(), "another user name");
    }

    #[test]
    fn test_breadcrumb_prepends() {
        let mut base = NodeBase::new();
        base.set_breadcrumb("sort");
        assert_eq!(base.name(), "sort");

        base.set_name("merge", NamePriority::User);
        base.set_breadcrumb("outer");
        assert_eq!(base.name(), "outer | merge");
    }

    #[test]
    fn test_plot_options_combine() {
        let options = PlotOptions::SIMPLIFIED_HIDE | PlotOptions::BUFFERED;
        assert!(options.contains(PlotOptions::SIMPLIFIED_HIDE));
        assert!(options.contains(PlotOptions::BUFFERED));
        assert!(!PlotOptions::NONE.contains(PlotOptions::BUFFERED));
    }

    #[test]
    fn test_datastructure_requests_fold_priority() {
        let mut base = NodeBase::new();
        base.register_datastructure_usage("heap", 1.0).unwrap();
        base.register_datastructure_usage("heap", 4.0).unwrap();
        assert_eq!(base.datastructure_requests()["heap"].priority, 4.0);
    }

    #[test]
    fn test_negative_or_nan_memory_fraction_is_rejected() {
        let mut base = NodeBase::new();
        assert!(matches!(
            base.set_memory_fraction(-0.5),
            Err(PipelineError::InvalidWeight { .. })
        ));
        assert!(matches!(
            base.set_memory_fraction(f64::NAN),
            Err(PipelineError::InvalidWeight { .. })
        ));
        assert_eq!(base.memory_fraction(), 0.0);

        base.set_memory_fraction(2.0).unwrap();
        assert_eq!(base.memory_fraction(), 2.0);
    }

    #[test]
    fn test_invalid_datastructure_priority_is_rejected() {
        let mut base = NodeBase::new();
        assert!(matches!(
            base.register_datastructure_usage("heap", f64::NAN),
            Err(PipelineError::InvalidWeight { .. })
        ));
        assert!(matches!(
            base.register_datastructure_usage("heap", -1.0),
            Err(PipelineError::InvalidWeight { .. })
        ));
        // A rejected registration leaves no request behind.
        assert!(base.datastructure_requests().is_empty());
    }

    #[test]
    fn test_shared_datastructure_roundtrip() {
        let mut base = NodeBase::new();
        base.register_datastructure_usage("table", 1.0).unwrap();
        base.set_datastructure("table", vec![1u32, 2, 3]).unwrap();

        let table = base.get_datastructure::<Vec<u32>>("table").unwrap();
        assert_eq!(*table, vec![1, 2, 3]);

        let err = base.get_datastructure::<String>("table").err().unwrap();
        assert!(matches!(err, PipelineError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unregistered_datastructure() {
        let base = NodeBase::new();
        assert!(matches!(
            base.set_datastructure("nope", 1u8),
            Err(PipelineError::UnregisteredDatastructure(_))
        ));
        assert!(matches!(
            base.get_datastructure::<u8>("nope"),
            Err(PipelineError::UnregisteredDatastructure(_))
        ));
    }
}
