#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use qaflow_core::config::{EngineConfig, RegistryConfig};
use qaflow_core::error::{QaflowError, Result};
use qaflow_core::event::EventBus;
use qaflow_core::traits::{Capabilities, SessionStore};
use qaflow_core::types::{EvidenceRef, Session, SessionId, SessionSummary};
use qaflow_engine::graph::Phase;
use qaflow_engine::{
    Engine, GraphDescription, Node, RetryPolicy, SessionRegistry, StepOutcome, StepRegistry, Target,
    WorkflowGraph,
};
use qaflow_store::SqliteSessionStore;

/// Capabilities for steps that never call out.
pub struct Inert;

impl Capabilities for Inert {
    fn names(&self) -> Vec<String> {
        Vec::new()
    }

    fn perform(&self, action: &str, _args: Value) -> BoxFuture<'_, Result<Value>> {
        let action = action.to_string();
        Box::pin(async move { Ok(json!({ "performed": action })) })
    }

    fn capture<'a>(&'a self, label: &'a str, dir: &'a Path) -> BoxFuture<'a, Result<EvidenceRef>> {
        Box::pin(async move { Ok(EvidenceRef::new("screenshot", label, dir.join(label))) })
    }
}

/// Store whose writes can be made to fail on demand.
pub struct FlakyStore {
    inner: SqliteSessionStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteSessionStore::in_memory().unwrap(),
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl SessionStore for FlakyStore {
    fn save(&self, session: &Session) -> BoxFuture<'_, Result<()>> {
        if self.failing.load(Ordering::SeqCst) {
            return Box::pin(async { Err(QaflowError::Persistence("database is locked".into())) });
        }
        self.inner.save(session)
    }

    fn load(&self, id: &SessionId) -> BoxFuture<'_, Result<Option<Session>>> {
        self.inner.load(id)
    }

    fn list(&self, limit: usize) -> BoxFuture<'_, Result<Vec<SessionSummary>>> {
        self.inner.list(limit)
    }

    fn count(&self) -> BoxFuture<'_, Result<usize>> {
        self.inner.count()
    }
}

pub fn registry(store: Arc<dyn SessionStore>) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(
        store,
        RegistryConfig::default(),
        PathBuf::from("/tmp/qaflow-it"),
    ))
}

pub fn engine(registry: Arc<SessionRegistry>, steps: StepRegistry) -> Engine {
    Engine::new(
        registry,
        steps,
        Arc::new(Inert),
        Arc::new(EventBus::new(256)),
        EngineConfig::default(),
    )
}

/// `login` (Auth) then `submit` and `confirm` (Form). `submit` retries
/// `submit_attempts` times and fails the run when exhausted.
pub fn login_submit_confirm(submit_attempts: u32) -> Arc<WorkflowGraph> {
    let desc = GraphDescription::new("signup", "login")
        .phase(Phase::new("Auth", "sign in"))
        .phase(Phase::new("Form", "fill, submit, confirm"))
        .node(Node::new("login", "Auth").then(Target::node("submit")))
        .node(
            Node::new("submit", "Form")
                .with_retry(RetryPolicy::attempts(submit_attempts).with_backoff(1, 1.0))
                .on_exhaustion(Target::Failed)
                .then(Target::node("confirm")),
        )
        .node(Node::new("confirm", "Form").terminal());
    Arc::new(WorkflowGraph::new(desc).unwrap())
}

/// Steps for `login_submit_confirm` that all succeed.
pub fn passing_steps() -> StepRegistry {
    let mut steps = StepRegistry::new();
    steps.register_fn("login", |_ctx| async { StepOutcome::Success(json!({"user": "qa-bot"})) });
    steps.register_fn("submit", |_ctx| async { StepOutcome::Success(json!({"form_id": 42})) });
    steps.register_fn("confirm", |_ctx| async { StepOutcome::Success(json!({"confirmed": true})) });
    steps
}

/// Replace `submit` with a step that always fails, counting its calls.
pub fn failing_submit(steps: &mut StepRegistry) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    steps.register_fn("submit", move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            StepOutcome::Failure("submit button not found".into())
        }
    });
    calls
}
