use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use qaflow_core::config::EngineConfig;
use qaflow_core::error::{GraphError, Result};
use qaflow_core::event::EventBus;
use qaflow_core::traits::Capabilities;
use qaflow_core::types::{EvidenceRef, RunStatus, Session, SessionId, SessionStatus, WorkflowEvent};

use crate::graph::{Node, Target, WorkflowGraph};
use crate::registry::SessionRegistry;
use crate::steps::{StepContext, StepLogic, StepOutcome, StepRegistry};

/// Result of one `Engine::run` call.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub session: Arc<Session>,
    pub elapsed_ms: u64,
}

/// How all attempts at one node ended.
enum NodeOutcome {
    Succeeded(Value),
    Exhausted,
    /// Suspended by the step or cancelled during backoff.
    Interrupted,
}

struct NodeRun {
    outcome: NodeOutcome,
    failures: Vec<(u32, String)>,
    evidence: Vec<EvidenceRef>,
    elapsed_ms: u64,
}

/// Walks workflow graphs against sessions held in the registry.
///
/// Each `run` owns exactly one working copy of its session; other contexts
/// only see it through snapshots published by the registry.
pub struct Engine {
    registry: Arc<SessionRegistry>,
    steps: StepRegistry,
    capabilities: Arc<dyn Capabilities>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        steps: StepRegistry,
        capabilities: Arc<dyn Capabilities>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            steps,
            capabilities,
            event_bus,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn step_timeout(&self) -> Option<Duration> {
        let secs = self.config.step_timeout_secs;
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Execute `graph` against the session until it completes, fails or
    /// pauses. Resumes at the session's `current_node` when it has one.
    #[instrument(skip_all, fields(session_id = %session_id, workflow = %graph.name()))]
    pub async fn run(
        &self,
        session_id: &SessionId,
        graph: Arc<WorkflowGraph>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let resolved = self.steps.resolve(&graph)?;

        // Reject a resume point this graph doesn't know before touching the status
        if let Some(node) = &self.registry.get(session_id).await?.current_node {
            graph.require(node)?;
        }

        let (lease, mut session) = self.registry.activate(session_id).await?;
        // Any early return from here drops the lease

        let mut current = session
            .current_node
            .clone()
            .unwrap_or_else(|| graph.start().to_string());
        graph.require(&current)?;

        session.workflow = Some(graph.name().to_string());
        self.event_bus.publish(WorkflowEvent::RunStarted {
            session_id: session_id.clone(),
            workflow: graph.name().to_string(),
            node: current.clone(),
        });
        info!(node = %current, "Run started");

        let mut visits: HashMap<String, u32> = HashMap::new();
        let status = loop {
            if cancel.is_cancelled() {
                session.current_node = Some(current.clone());
                break RunStatus::Paused;
            }

            let node = graph.require(&current)?;
            let seen = visits.entry(node.name.clone()).or_insert(0);
            *seen += 1;
            if *seen > self.config.max_node_visits {
                warn!(node = %node.name, visits = *seen, "Visit limit exceeded");
                session.push_error(
                    &node.name,
                    0,
                    format!("visited more than {} times in one run", self.config.max_node_visits),
                );
                break RunStatus::Failed;
            }

            session.current_node = Some(node.name.clone());
            session.current_phase = Some(node.phase.clone());

            let step = resolved.for_node(&node.name).ok_or_else(|| GraphError::UnknownStep {
                node: node.name.clone(),
                step: node.step_key().to_string(),
            })?;
            let run = self.run_node(&session, node, step, &cancel).await;

            session.add_evidence(&node.phase, run.evidence);
            for (attempt, message) in run.failures {
                session.push_error(&node.name, attempt, message);
            }

            let resolution = match run.outcome {
                NodeOutcome::Succeeded(result) => {
                    session.step_timings.insert(node.name.clone(), run.elapsed_ms);
                    let resolution = graph.resolve(&node.name, &session.outputs, &result)?;
                    session.record_success(&node.name, result);
                    resolution
                }
                NodeOutcome::Exhausted => {
                    session.step_timings.insert(node.name.clone(), run.elapsed_ms);
                    session.record_failure(&node.name);
                    graph.exhausted(&node.name)?
                }
                NodeOutcome::Interrupted => break RunStatus::Paused,
            };

            self.event_bus.publish(WorkflowEvent::Transition {
                session_id: session_id.clone(),
                from: node.name.clone(),
                to: resolution.target.to_string(),
                rule: resolution.rule,
            });
            debug!(
                from = %node.name,
                to = %resolution.target,
                rule = ?resolution.rule,
                "Transition"
            );

            match resolution.target {
                Target::Completed => {
                    session.current_node = None;
                    break RunStatus::Completed;
                }
                Target::Failed => break RunStatus::Failed,
                Target::Node(next) => {
                    let next_phase = graph.require(&next)?.phase.clone();
                    let boundary = next_phase != node.phase;
                    session.current_node = Some(next.clone());
                    session.current_phase = Some(next_phase.clone());

                    if boundary {
                        self.registry.commit(&lease, &mut session)?;
                        let revision = self.registry.checkpoint(session_id).await?;
                        self.event_bus.publish(WorkflowEvent::Checkpointed {
                            session_id: session_id.clone(),
                            phase: Some(next_phase),
                            revision,
                        });
                    }
                    current = next;
                }
            }
        };

        if status == RunStatus::Paused {
            self.event_bus.publish(WorkflowEvent::RunPaused {
                session_id: session_id.clone(),
                resume_at: session.current_node.clone(),
            });
            info!(resume_at = ?session.current_node, "Run paused");
        }

        let session = self
            .registry
            .deactivate(lease, session, SessionStatus::from(status))
            .await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.event_bus.publish(WorkflowEvent::Checkpointed {
            session_id: session_id.clone(),
            phase: session.current_phase.clone(),
            revision: session.revision,
        });
        self.event_bus.publish(WorkflowEvent::RunFinished {
            session_id: session_id.clone(),
            status,
            elapsed_ms,
        });
        info!(
            status = %status,
            executed = session.executed_nodes.len(),
            failed = session.failed_nodes.len(),
            elapsed_ms,
            "Run finished"
        );

        Ok(RunReport {
            status,
            session,
            elapsed_ms,
        })
    }

    /// Attempt `node` until it succeeds, runs out of attempts or is interrupted.
    async fn run_node(
        &self,
        session: &Session,
        node: &Node,
        step: &Arc<dyn StepLogic>,
        cancel: &CancellationToken,
    ) -> NodeRun {
        let snapshot = Arc::new(session.clone());
        let max_attempts = node.retry.max_attempts.max(1);
        let mut failures = Vec::new();
        let mut evidence = Vec::new();
        let mut attempt = 1;

        loop {
            self.event_bus.publish(WorkflowEvent::StepStarted {
                session_id: session.id.clone(),
                node: node.name.clone(),
                phase: node.phase.clone(),
                attempt,
            });

            let ctx = StepContext::new(
                snapshot.clone(),
                node.name.clone(),
                node.phase.clone(),
                node.actions.clone(),
                attempt,
                self.capabilities.clone(),
                cancel.clone(),
            );
            let attempt_started = Instant::now();
            let outcome = self.invoke(step, ctx.clone()).await;
            let elapsed_ms = attempt_started.elapsed().as_millis() as u64;
            evidence.extend(ctx.take_evidence());

            let message = match outcome {
                StepOutcome::Success(result) => {
                    self.event_bus.publish(WorkflowEvent::StepCompleted {
                        session_id: session.id.clone(),
                        node: node.name.clone(),
                        elapsed_ms,
                    });
                    return NodeRun {
                        outcome: NodeOutcome::Succeeded(result),
                        failures,
                        evidence,
                        elapsed_ms,
                    };
                }
                StepOutcome::Suspend => {
                    debug!(node = %node.name, attempt, "Step suspended");
                    return NodeRun {
                        outcome: NodeOutcome::Interrupted,
                        failures,
                        evidence,
                        elapsed_ms,
                    };
                }
                StepOutcome::Failure(message) => message,
            };

            warn!(node = %node.name, attempt, error = %message, "Step attempt failed");
            self.event_bus.publish(WorkflowEvent::StepFailed {
                session_id: session.id.clone(),
                node: node.name.clone(),
                attempt,
                error: message.clone(),
            });
            failures.push((attempt, message));

            if attempt >= max_attempts {
                return NodeRun {
                    outcome: NodeOutcome::Exhausted,
                    failures,
                    evidence,
                    elapsed_ms,
                };
            }

            let delay = node.retry.delay_after(attempt);
            self.event_bus.publish(WorkflowEvent::StepRetrying {
                session_id: session.id.clone(),
                node: node.name.clone(),
                next_attempt: attempt + 1,
                backoff_ms: delay.as_millis() as u64,
            });
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(node = %node.name, "Cancelled during backoff");
                    return NodeRun {
                        outcome: NodeOutcome::Interrupted,
                        failures,
                        evidence,
                        elapsed_ms,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn invoke(&self, step: &Arc<dyn StepLogic>, ctx: StepContext) -> StepOutcome {
        let attempt = step.invoke(ctx);
        match self.step_timeout() {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::Failure(format!("timed out after {}s", limit.as_secs())),
            },
            None => attempt.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphDescription, Phase, RetryPolicy};
    use futures::future::BoxFuture;
    use qaflow_core::config::RegistryConfig;
    use qaflow_core::error::QaflowError;
    use qaflow_store::SqliteSessionStore;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoCapabilities;

    impl Capabilities for NoCapabilities {
        fn names(&self) -> Vec<String> {
            Vec::new()
        }

        fn perform(&self, action: &str, _args: Value) -> BoxFuture<'_, Result<Value>> {
            let action = action.to_string();
            Box::pin(async move {
                Err(QaflowError::StepFailure {
                    node: String::new(),
                    message: format!("no capability for {}", action),
                })
            })
        }

        fn capture<'a>(
            &'a self,
            label: &'a str,
            dir: &'a Path,
        ) -> BoxFuture<'a, Result<EvidenceRef>> {
            Box::pin(async move { Ok(EvidenceRef::new("note", label, dir.join(label))) })
        }
    }

    fn engine(steps: StepRegistry, config: EngineConfig) -> Engine {
        let store = Arc::new(SqliteSessionStore::in_memory().unwrap());
        let registry = Arc::new(SessionRegistry::new(
            store,
            RegistryConfig::default(),
            PathBuf::from("/tmp/qaflow-engine-tests"),
        ));
        Engine::new(
            registry,
            steps,
            Arc::new(NoCapabilities),
            Arc::new(EventBus::new(64)),
            config,
        )
    }

    fn branching_graph() -> Arc<WorkflowGraph> {
        let desc = GraphDescription::new("branching", "check")
            .phase(Phase::new("Main", ""))
            .node(
                Node::new("check", "Main")
                    .when(r#"route == "left""#, Target::node("left"))
                    .then(Target::node("right")),
            )
            .node(Node::new("left", "Main").terminal())
            .node(Node::new("right", "Main").terminal());
        Arc::new(WorkflowGraph::new(desc).unwrap())
    }

    fn ok_step(steps: &mut StepRegistry, name: &str, result: Value) {
        steps.register_fn(name, move |_ctx| {
            let result = result.clone();
            async move { StepOutcome::Success(result) }
        });
    }

    #[tokio::test]
    async fn test_first_matching_transition_is_followed() {
        let mut steps = StepRegistry::new();
        ok_step(&mut steps, "check", json!({"route": "left"}));
        ok_step(&mut steps, "left", json!({}));
        ok_step(&mut steps, "right", json!({}));
        let engine = engine(steps, EngineConfig::default());

        let id = engine.registry().create("branch", None);
        let report = engine.run(&id, branching_graph(), CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.session.executed_nodes, vec!["check", "left"]);
        assert_eq!(report.session.outputs["route"], json!("left"));
        assert!(report.session.current_node.is_none());
        assert_eq!(report.session.workflow.as_deref(), Some("branching"));
    }

    #[tokio::test]
    async fn test_missing_step_is_rejected_before_activation() {
        let engine = engine(StepRegistry::new(), EngineConfig::default());
        let id = engine.registry().create("t", None);
        let err = engine.run(&id, branching_graph(), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, QaflowError::Graph(GraphError::UnknownStep { .. })));
        assert_eq!(engine.registry().get(&id).await.unwrap().status, SessionStatus::Created);
    }

    #[tokio::test]
    async fn test_unknown_resume_point_leaves_session_paused() {
        let mut steps = StepRegistry::new();
        ok_step(&mut steps, "check", json!({}));
        ok_step(&mut steps, "left", json!({}));
        ok_step(&mut steps, "right", json!({}));
        let engine = engine(steps, EngineConfig::default());

        let id = engine.registry().create("moved", None);
        let (lease, mut session) = engine.registry().activate(&id).await.unwrap();
        session.current_node = Some("checkout".into());
        engine
            .registry()
            .deactivate(lease, session, SessionStatus::Paused)
            .await
            .unwrap();
        let before = engine.registry().get(&id).await.unwrap();

        let err = engine.run(&id, branching_graph(), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            QaflowError::Graph(GraphError::UnknownNode(ref n)) if n == "checkout"
        ));

        let after = engine.registry().get(&id).await.unwrap();
        assert_eq!(after.status, SessionStatus::Paused);
        assert_eq!(after.revision, before.revision);
        assert!(engine.registry().activate(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_visit_limit_fails_run() {
        let desc = GraphDescription::new("loop", "poll")
            .phase(Phase::new("Main", ""))
            .node(
                Node::new("poll", "Main")
                    .when("ready exists", Target::Completed)
                    .then(Target::node("poll")),
            );
        // Conditional self-loop: valid, but bounded at run time
        let graph = Arc::new(WorkflowGraph::new(desc).unwrap());

        let mut steps = StepRegistry::new();
        ok_step(&mut steps, "poll", json!({"ready": null}));
        let config = EngineConfig {
            max_node_visits: 3,
            ..EngineConfig::default()
        };
        let engine = engine(steps, config);

        let id = engine.registry().create("poll", None);
        let report = engine.run(&id, graph, CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.session.executed_nodes, vec!["poll"]);
        assert!(report.session.failed_nodes.is_empty());
        assert!(report.session.errors.last().unwrap().message.contains("visited more than 3"));
    }

    #[tokio::test]
    async fn test_step_timeout_counts_as_failure() {
        let desc = GraphDescription::new("slow", "wait")
            .phase(Phase::new("Main", ""))
            .node(Node::new("wait", "Main").with_retry(RetryPolicy::attempts(1)).terminal());
        let graph = Arc::new(WorkflowGraph::new(desc).unwrap());

        let mut steps = StepRegistry::new();
        steps.register_fn("wait", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StepOutcome::Success(Value::Null)
        });
        let config = EngineConfig {
            step_timeout_secs: 1,
            ..EngineConfig::default()
        };
        let engine = engine(steps, config);

        let id = engine.registry().create("slow", None);
        let report = engine.run(&id, graph, CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.session.failed_nodes, vec!["wait"]);
        assert!(report.session.errors[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_retry_then_success_keeps_error_history() {
        let desc = GraphDescription::new("flaky", "load")
            .phase(Phase::new("Main", ""))
            .node(
                Node::new("load", "Main")
                    .with_retry(RetryPolicy::attempts(3).with_backoff(1, 1.0))
                    .terminal(),
            );
        let graph = Arc::new(WorkflowGraph::new(desc).unwrap());

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut steps = StepRegistry::new();
        steps.register_fn("load", move |ctx: StepContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt < 2 {
                    StepOutcome::Failure("page not ready".into())
                } else {
                    StepOutcome::Success(json!({"loaded": true}))
                }
            }
        });
        let engine = engine(steps, EngineConfig::default());
        let mut events = engine.event_bus().subscribe();

        let id = engine.registry().create("flaky", None);
        let report = engine.run(&id, graph, CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.session.errors.len(), 1);
        assert_eq!(report.session.errors[0].attempt, 1);
        assert!(report.session.failed_nodes.is_empty());

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert_eq!(kinds.first(), Some(&"run_started"));
        assert!(kinds.contains(&"step_retrying"));
        assert_eq!(kinds.last(), Some(&"run_finished"));
    }
}
