#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
mod executor;
mod graph;
mod memory;
mod node;
mod phase;
pub mod plot;
mod progress;
mod token;
mod utils;

pub use crate::core::{MemorySize, NamePriority, NodeId, StepCount};
pub use crate::error::PipelineError;
pub use crate::executor::{PhaseReport, Pipeline, RunReport};
pub use crate::node::{Node, NodeBase, NodeParameters, PlotOptions, State};
pub use crate::phase::{Phase, PhasePlan};
pub use crate::progress::{NullProgress, Progress, StepOverflow, TerminalProgress};
pub use crate::token::{Edge, NodeMap, Relation, Token};
pub use crate::utils::init_logging;
