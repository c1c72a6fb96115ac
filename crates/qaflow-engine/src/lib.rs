pub mod client;
pub mod engine;
pub mod graph;
pub mod registry;
pub mod run_log;
pub mod steps;

pub use client::{default_catalog, QaClient, QaClientBuilder};
pub use engine::{Engine, RunReport};
pub use graph::{
    from_generator, FallbackCatalog, FileGenerator, GraphDescription, GraphGenerator, GraphSchema,
    GraphSelection, GraphSource, Node, RetryPolicy, Target, WorkflowGraph,
};
pub use registry::{CleanupReport, Lease, RegistryStats, SessionRegistry};
pub use run_log::RunLogger;
pub use steps::{ActionStep, StepContext, StepLogic, StepOutcome, StepRegistry, ACTION_STEP};
