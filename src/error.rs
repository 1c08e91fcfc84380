use thiserror::Error;

use crate::core::{MemorySize, NodeId};
use crate::node::State;

/// Errors raised by the pipelining framework.
///
/// Every variant except the ones produced by [`crate::NodeBase::step`]
/// overflow handling is fatal to the running phase: the executor unwinds,
/// releases its scoped resources and surfaces the error to the caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("node '{0}' is not an initiator node")]
    NotInitiator(String),

    #[error("lifecycle violation on node '{node}': expected state {expected:?}, found {found:?}")]
    Lifecycle {
        node: String,
        expected: State,
        found: State,
    },

    #[error("insufficient memory for phase '{phase}': minimum {required} exceeds budget {available}")]
    InsufficientMemory {
        phase: String,
        required: MemorySize,
        available: MemorySize,
    },

    #[error("invalid memory weight {weight} for '{consumer}': must be finite and non-negative")]
    InvalidWeight { consumer: String, weight: f64 },

    #[error("datastructure '{0}' is not registered")]
    UnregisteredDatastructure(String),

    #[error("type mismatch for '{key}': expected {expected}, stored {stored}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        stored: &'static str,
    },

    #[error("cyclic dependencies between phases")]
    CyclicPhases,

    #[error("item-flow graph contains a cycle")]
    CyclicItemFlow,

    #[error("phase '{phase}' has {count} initiator nodes, expected exactly one")]
    NoOrMultipleInitiators { phase: String, count: usize },

    #[error("no node registered for token {0}")]
    MissingNode(NodeId),

    #[error("no value forwarded under key '{0}'")]
    MissingKey(String),

    #[error("node '{node}': {error}")]
    Hook { node: String, error: anyhow::Error },
}
