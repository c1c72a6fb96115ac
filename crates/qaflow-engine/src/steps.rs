use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use qaflow_core::error::{GraphError, Result};
use qaflow_core::traits::Capabilities;
use qaflow_core::types::{EvidenceRef, Session};

use crate::graph::WorkflowGraph;

/// Step key of the generic browser-action step.
pub const ACTION_STEP: &str = "browser_actions";

/// What a single step attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Value),
    Failure(String),
    /// Stop here and pause the session; the node runs again on resume.
    Suspend,
}

/// Everything a step attempt may look at. The session is a read-only
/// snapshot; results flow back through the outcome and the evidence recorder.
#[derive(Clone)]
pub struct StepContext {
    pub session: Arc<Session>,
    pub node: String,
    pub phase: String,
    pub actions: Vec<String>,
    pub attempt: u32,
    pub capabilities: Arc<dyn Capabilities>,
    pub artifacts_dir: PathBuf,
    pub cancel: CancellationToken,
    evidence: Arc<Mutex<Vec<EvidenceRef>>>,
}

impl StepContext {
    pub fn new(
        session: Arc<Session>,
        node: impl Into<String>,
        phase: impl Into<String>,
        actions: Vec<String>,
        attempt: u32,
        capabilities: Arc<dyn Capabilities>,
        cancel: CancellationToken,
    ) -> Self {
        let artifacts_dir = session.artifacts_dir.clone();
        Self {
            session,
            node: node.into(),
            phase: phase.into(),
            actions,
            attempt,
            capabilities,
            artifacts_dir,
            cancel,
            evidence: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Directory evidence files for this session are written to.
    pub fn evidence_dir(&self) -> PathBuf {
        self.artifacts_dir.join("evidence")
    }

    /// Capture evidence through the capability set and record it.
    pub async fn capture(&self, label: &str) -> Result<EvidenceRef> {
        let dir = self.evidence_dir();
        let mut evidence = self.capabilities.capture(label, &dir).await?;
        evidence.node = Some(self.node.clone());
        self.record(evidence.clone());
        Ok(evidence)
    }

    pub fn record(&self, evidence: EvidenceRef) {
        if let Ok(mut recorded) = self.evidence.lock() {
            recorded.push(evidence);
        }
    }

    /// Drain everything recorded so far.
    pub fn take_evidence(&self) -> Vec<EvidenceRef> {
        self.evidence
            .lock()
            .map(|mut recorded| std::mem::take(&mut *recorded))
            .unwrap_or_default()
    }
}

/// Automation logic bound to a step key.
pub trait StepLogic: Send + Sync + 'static {
    fn invoke(&self, ctx: StepContext) -> BoxFuture<'_, StepOutcome>;
}

/// Adapts an async closure into a step.
pub struct FnStep<F> {
    f: F,
}

impl<F, Fut> FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepOutcome> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> StepLogic for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepOutcome> + Send + 'static,
{
    fn invoke(&self, ctx: StepContext) -> BoxFuture<'_, StepOutcome> {
        Box::pin((self.f)(ctx))
    }
}

/// Performs the node's declared actions in order, capturing evidence after
/// each one. The first failing action fails the attempt.
pub struct ActionStep;

impl StepLogic for ActionStep {
    fn invoke(&self, ctx: StepContext) -> BoxFuture<'_, StepOutcome> {
        Box::pin(async move {
            let mut results = serde_json::Map::new();

            for (i, action) in ctx.actions.iter().enumerate() {
                if i > 0 && ctx.cancel.is_cancelled() {
                    return StepOutcome::Suspend;
                }
                if !ctx.capabilities.supports(action) {
                    return StepOutcome::Failure(format!("unsupported action: {}", action));
                }

                let args = json!({
                    "node": ctx.node,
                    "phase": ctx.phase,
                    "attempt": ctx.attempt,
                    "label": ctx.session.label,
                });
                let value = match ctx.capabilities.perform(action, args).await {
                    Ok(v) => v,
                    Err(e) => return StepOutcome::Failure(format!("{}: {}", action, e)),
                };
                debug!(node = %ctx.node, action = %action, "Action performed");

                if let Err(e) = ctx.capture(&format!("{}_{}", ctx.node, action)).await {
                    return StepOutcome::Failure(format!(
                        "evidence capture after {}: {}",
                        action, e
                    ));
                }
                results.insert(action.clone(), value);
            }

            StepOutcome::Success(Value::Object(results))
        })
    }
}

/// Step logic keyed by step name.
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn StepLogic>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the generic action step already registered.
    pub fn with_action_step() -> Self {
        let mut registry = Self::new();
        registry.register(ACTION_STEP, ActionStep);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, step: impl StepLogic) {
        self.steps.insert(name.into(), Arc::new(step));
    }

    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutcome> + Send + 'static,
    {
        self.register(name, FnStep::new(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepLogic>> {
        self.steps.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Bind every node of `graph` to its step logic, once per graph load.
    pub fn resolve(&self, graph: &WorkflowGraph) -> std::result::Result<ResolvedSteps, GraphError> {
        let mut by_node = HashMap::with_capacity(graph.nodes().len());
        for node in graph.nodes() {
            let step = self.get(node.step_key()).ok_or_else(|| GraphError::UnknownStep {
                node: node.name.clone(),
                step: node.step_key().to_string(),
            })?;
            by_node.insert(node.name.clone(), step);
        }
        Ok(ResolvedSteps { by_node })
    }
}

/// Step logic per node of one graph.
pub struct ResolvedSteps {
    by_node: HashMap<String, Arc<dyn StepLogic>>,
}

impl ResolvedSteps {
    pub fn for_node(&self, node: &str) -> Option<&Arc<dyn StepLogic>> {
        self.by_node.get(node)
    }
}
