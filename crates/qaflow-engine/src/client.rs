use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use qaflow_core::config::AppConfig;
use qaflow_core::error::Result;
use qaflow_core::event::EventBus;
use qaflow_core::traits::{Capabilities, SessionStore};
use qaflow_core::types::{Session, SessionId, SessionSnapshot, SessionSummary};

use crate::engine::{Engine, RunReport};
use crate::graph::builtin::{self, APP_CREATION};
use crate::graph::{
    from_generator, FallbackCatalog, FileGenerator, GraphGenerator, GraphSchema, GraphSelection,
};
use crate::registry::{CleanupReport, RegistryStats, SessionRegistry};
use crate::run_log::RunLogger;
use crate::steps::StepRegistry;

/// Builder for [`QaClient`].
pub struct QaClientBuilder {
    config: AppConfig,
    store: Arc<dyn SessionStore>,
    capabilities: Arc<dyn Capabilities>,
    steps: StepRegistry,
    catalog: Option<FallbackCatalog>,
    generator: Option<Arc<dyn GraphGenerator>>,
}

impl QaClientBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the step table. Defaults to the action step only.
    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    /// Replace the fallback catalog. Defaults to the built-in app-creation graph.
    pub fn catalog(mut self, catalog: FallbackCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn GraphGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn build(self) -> Result<QaClient> {
        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => default_catalog()?,
        };
        let generator = self.generator.or_else(|| {
            self.config
                .generator
                .graph_file
                .as_ref()
                .map(|path| Arc::new(FileGenerator::new(path)) as Arc<dyn GraphGenerator>)
        });

        let registry = Arc::new(SessionRegistry::new(
            self.store,
            self.config.registry.clone(),
            self.config.results_root(),
        ));
        let event_bus = Arc::new(EventBus::new(self.config.engine.event_buffer));
        let engine = Arc::new(Engine::new(
            registry.clone(),
            self.steps,
            self.capabilities,
            event_bus,
            self.config.engine.clone(),
        ));

        Ok(QaClient {
            registry,
            engine,
            catalog,
            generator,
            schema: GraphSchema::current(),
            config: self.config,
        })
    }
}

/// Catalog holding the built-in app-creation graph, also used as the default family.
pub fn default_catalog() -> Result<FallbackCatalog> {
    let mut catalog = FallbackCatalog::new();
    catalog.register(APP_CREATION, builtin::app_creation())?;
    catalog.set_default(APP_CREATION);
    Ok(catalog)
}

/// Entry point for embedding qaflow: session management plus graph
/// selection and execution behind one handle.
pub struct QaClient {
    registry: Arc<SessionRegistry>,
    engine: Arc<Engine>,
    catalog: FallbackCatalog,
    generator: Option<Arc<dyn GraphGenerator>>,
    schema: GraphSchema,
    config: AppConfig,
}

impl QaClient {
    pub fn builder(
        store: Arc<dyn SessionStore>,
        capabilities: Arc<dyn Capabilities>,
    ) -> QaClientBuilder {
        QaClientBuilder {
            config: AppConfig::default(),
            store,
            capabilities,
            steps: StepRegistry::with_action_step(),
            catalog: None,
            generator: None,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn catalog(&self) -> &FallbackCatalog {
        &self.catalog
    }

    pub fn schema(&self) -> &GraphSchema {
        &self.schema
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Pick the graph for `objective`: generated when possible, static otherwise.
    pub async fn prepare_graph(&self, objective: &str) -> Result<GraphSelection> {
        let capabilities = self.engine.steps().names();
        from_generator(
            objective,
            &capabilities,
            &self.schema,
            self.generator.as_deref(),
            &self.catalog,
        )
        .await
    }

    pub fn create(&self, label: &str, owner: Option<String>) -> SessionId {
        self.registry.create(label, owner)
    }

    /// Create a session and run it to completion, failure or pause.
    pub async fn start(
        &self,
        label: &str,
        owner: Option<String>,
        objective: &str,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let selection = self.prepare_graph(objective).await?;
        let id = self.registry.create(label, owner);
        info!(session_id = %id, graph = selection.graph.name(), "Starting session");
        self.run_logged(&id, selection, cancel).await
    }

    /// Continue a paused (or interrupted) session from its resume point.
    pub async fn resume(
        &self,
        id: &SessionId,
        objective: &str,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        // Fail fast on unknown ids before asking a generator for a graph
        self.registry.get(id).await?;
        let selection = self.prepare_graph(objective).await?;
        info!(session_id = %id, graph = selection.graph.name(), "Resuming session");
        self.run_logged(id, selection, cancel).await
    }

    async fn run_logged(
        &self,
        id: &SessionId,
        selection: GraphSelection,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let log_stop = CancellationToken::new();
        let logger = if self.config.log.enabled {
            let logs_dir = self.registry.get(id).await?.artifacts_dir.join("logs");
            Some(RunLogger::new(logs_dir, self.config.log.level).spawn(
                self.engine.event_bus(),
                id.clone(),
                log_stop.clone(),
            ))
        } else {
            None
        };

        let result = self.engine.run(id, selection.graph, cancel).await;

        if let Some(handle) = logger {
            // The logger drains what is queued before honouring the stop
            log_stop.cancel();
            if let Err(e) = handle.await {
                debug!(error = %e, "Run logger task ended abnormally");
            }
        }
        result
    }

    pub fn list_active(&self) -> Vec<SessionSummary> {
        self.registry.list_active()
    }

    pub async fn list_all(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        self.registry.list_all(limit).await
    }

    pub async fn detail(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.registry.get(id).await
    }

    pub async fn cleanup(&self, max_active: usize, max_age_days: u64) -> CleanupReport {
        self.registry.cleanup(max_active, max_age_days).await
    }

    pub async fn export(&self, id: &SessionId) -> Result<SessionSnapshot> {
        self.registry.export(id).await
    }

    pub async fn import(&self, snapshot: SessionSnapshot) -> Result<SessionId> {
        self.registry.import(snapshot).await
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        self.registry.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphSource;
    use futures::future::BoxFuture;
    use qaflow_core::error::QaflowError;
    use qaflow_core::types::{EvidenceRef, RunStatus};
    use qaflow_store::SqliteSessionStore;
    use serde_json::{json, Value};
    use std::path::Path;

    /// Performs every action the built-in graph asks for.
    struct Permissive;

    impl Capabilities for Permissive {
        fn names(&self) -> Vec<String> {
            Vec::new()
        }

        fn supports(&self, _action: &str) -> bool {
            true
        }

        fn perform(&self, action: &str, _args: Value) -> BoxFuture<'_, Result<Value>> {
            let action = action.to_string();
            Box::pin(async move { Ok(json!({ "performed": action })) })
        }

        fn capture<'a>(
            &'a self,
            label: &'a str,
            dir: &'a Path,
        ) -> BoxFuture<'a, Result<EvidenceRef>> {
            let path = dir.join(format!("{}.png", label));
            Box::pin(async move { Ok(EvidenceRef::new("screenshot", label, path)) })
        }
    }

    fn client(workspace: &Path) -> QaClient {
        let mut config = AppConfig::default();
        config.workspace.dir = workspace.display().to_string();
        QaClient::builder(Arc::new(SqliteSessionStore::in_memory().unwrap()), Arc::new(Permissive))
            .config(config)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_prepare_graph_falls_back_without_generator() {
        let dir = tempfile::tempdir().unwrap();
        let selection = client(dir.path()).prepare_graph("anything at all").await.unwrap();
        assert_eq!(selection.graph.name(), APP_CREATION);
        assert_eq!(
            selection.source,
            GraphSource::Fallback {
                family: APP_CREATION.into(),
                reason: None,
            }
        );
    }

    #[tokio::test]
    async fn test_start_runs_builtin_graph_and_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path());

        let report = client
            .start("smoke", None, APP_CREATION, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.session.executed_nodes.len(), 10);
        assert_eq!(report.session.evidence_count(), 9);
        assert!(report.session.artifacts_dir.starts_with(dir.path().join("results")));

        let logs = report.session.artifacts_dir.join("logs");
        let file = std::fs::read_dir(&logs).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.lines().last().unwrap().contains("run_finished"));
    }

    #[tokio::test]
    async fn test_resume_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let err = client(dir.path())
            .resume(&SessionId::from("missing"), APP_CREATION, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QaflowError::SessionNotFound(_)));
    }
}
