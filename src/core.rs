use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Amount of memory, in bytes.
pub type MemorySize = u64;

/// Number of progress steps.
pub type StepCount = u64;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a node.
///
/// Ids are handed out in creation order and never reused, which makes them
/// usable as a deterministic tie-break wherever an ordering between nodes
/// is otherwise ambiguous.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn fresh() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority of a node name, used when picking the display name of a phase.
///
/// Higher wins; a later call with equal priority also wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum NamePriority {
    /// Name derived by the framework.
    #[default]
    Default,
    /// Name suggested by a generic component.
    Hint,
    /// Name chosen by the user.
    User,
}
