use thiserror::Error;

/// Structural problems with a workflow graph. Always fatal, raised before any
/// session is touched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph has no nodes")]
    Empty,

    #[error("start node not found: {0}")]
    MissingStart(String),

    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("duplicate phase name: {0}")]
    DuplicatePhase(String),

    #[error("node {node} references undeclared phase {phase}")]
    UnknownPhase { node: String, phase: String },

    #[error("node {node} routes to unknown node {target}")]
    UnknownTarget { node: String, target: String },

    #[error("transitions of node {0} are not total (last rule must be `always`)")]
    NonTotal(String),

    #[error("terminal node {0} declares outgoing transitions")]
    TerminalWithTransitions(String),

    #[error("node {0} is unreachable from the start node")]
    Unreachable(String),

    #[error("unconditional cycle through: {}", .0.join(" -> "))]
    UnconditionalCycle(Vec<String>),

    #[error("node {node} has an unparseable condition: {expr}")]
    InvalidCondition { node: String, expr: String },

    #[error("node {0} has an invalid retry policy (max_attempts must be >= 1)")]
    InvalidRetry(String),

    #[error("node {node} uses step {step} which is not in the capability set")]
    UnknownStep { node: String, step: String },

    #[error("node not found in graph: {0}")]
    UnknownNode(String),
}

#[derive(Debug, Error)]
pub enum QaflowError {
    // Graph errors
    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphError),

    #[error("Graph generator failed: {0}")]
    Generator(String),

    // Step errors
    #[error("Step failed: {node}: {message}")]
    StepFailure { node: String, message: String },

    // Session errors
    #[error("Session already active: {0}")]
    SessionConflict(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QaflowError>;
