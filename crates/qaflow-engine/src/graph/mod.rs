//! Workflow graphs: named steps grouped into phases, connected by ordered
//! conditional transitions.
//!
//! A `GraphDescription` is the serializable form that generators return and
//! files contain. `WorkflowGraph::new` validates it once and produces the
//! read-only, indexed form the engine walks. `from_generator` chooses between
//! a generated graph and a static fallback from the `FallbackCatalog`.

pub mod builtin;
pub mod generator;
pub mod node;
pub mod transition;
pub mod validate;
pub mod workflow;

pub use generator::{
    from_generator, FallbackCatalog, FileGenerator, GraphGenerator, GraphSchema, GraphSelection,
    GraphSource,
};
pub use node::{Node, RetryPolicy, Target};
pub use transition::{Condition, EvalContext, Predicate, Transition};
pub use workflow::{GraphDescription, GraphSummary, Phase, PhaseSummary, Resolution, WorkflowGraph};
