use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use qaflow_core::error::{GraphError, QaflowError, Result};

use super::workflow::{GraphDescription, WorkflowGraph};

/// JSON Schema handed to generators, with the version they must target.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSchema {
    pub version: u32,
    pub schema: serde_json::Value,
}

impl GraphSchema {
    pub const VERSION: u32 = 1;

    pub fn current() -> Self {
        let target = json!({
            "type": "string",
            "description": "node name, \"completed\" or \"failed\""
        });
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "GraphDescription",
            "type": "object",
            "required": ["name", "start", "phases", "nodes"],
            "properties": {
                "name": { "type": "string" },
                "description": { "type": "string" },
                "schema_version": { "type": "integer", "const": Self::VERSION },
                "start": { "type": "string" },
                "phases": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name"],
                        "properties": {
                            "name": { "type": "string" },
                            "description": { "type": "string" }
                        }
                    }
                },
                "nodes": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "required": ["name", "phase"],
                        "properties": {
                            "name": { "type": "string" },
                            "phase": { "type": "string" },
                            "step": { "type": "string" },
                            "description": { "type": "string" },
                            "actions": { "type": "array", "items": { "type": "string" } },
                            "transitions": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["to"],
                                    "properties": {
                                        "when": {
                                            "type": "string",
                                            "description": concat!(
                                                "\"always\", key == \"v\", key != \"v\", ",
                                                "key contains \"v\" or key exists"
                                            )
                                        },
                                        "to": target
                                    }
                                }
                            },
                            "retry": {
                                "type": "object",
                                "properties": {
                                    "max_attempts": { "type": "integer", "minimum": 1 },
                                    "backoff_ms": { "type": "integer", "minimum": 0 },
                                    "backoff_multiplier": { "type": "number", "minimum": 1 },
                                    "max_backoff_ms": { "type": "integer", "minimum": 0 },
                                    "jitter": { "type": "boolean" }
                                }
                            },
                            "on_exhaustion": target,
                            "terminal": { "type": "boolean" }
                        }
                    }
                }
            }
        });
        Self {
            version: Self::VERSION,
            schema,
        }
    }

    /// Decode a generator response into a description.
    pub fn decode(&self, value: serde_json::Value) -> Result<GraphDescription> {
        let desc: GraphDescription = serde_json::from_value(value)
            .map_err(|e| QaflowError::Generator(format!("response does not match schema: {}", e)))?;
        match desc.schema_version {
            Some(v) if v != self.version => Err(QaflowError::Generator(format!(
                "schema version {} does not match expected {}",
                v, self.version
            ))),
            _ => Ok(desc),
        }
    }
}

impl Default for GraphSchema {
    fn default() -> Self {
        Self::current()
    }
}

/// External graph producer, typically an LLM call.
pub trait GraphGenerator: Send + Sync + 'static {
    /// Short name for logs and selection reports.
    fn name(&self) -> &str;

    /// Produce a graph description for `objective` as JSON.
    fn generate<'a>(
        &'a self,
        objective: &'a str,
        capabilities: &'a [String],
        schema: &'a GraphSchema,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// Replays a pre-generated description from a JSON file.
pub struct FileGenerator {
    path: PathBuf,
}

impl FileGenerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl GraphGenerator for FileGenerator {
    fn name(&self) -> &str {
        "file"
    }

    fn generate<'a>(
        &'a self,
        _objective: &'a str,
        _capabilities: &'a [String],
        _schema: &'a GraphSchema,
    ) -> BoxFuture<'a, Result<serde_json::Value>> {
        Box::pin(async move {
            let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                QaflowError::Generator(format!("cannot read {}: {}", self.path.display(), e))
            })?;
            serde_json::from_str(&raw).map_err(|e| {
                QaflowError::Generator(format!("{} is not valid JSON: {}", self.path.display(), e))
            })
        })
    }
}

/// Static graphs keyed by objective family. Each is validated once, when
/// registered.
#[derive(Default, Clone)]
pub struct FallbackCatalog {
    graphs: HashMap<String, Arc<WorkflowGraph>>,
    order: Vec<String>,
    default_family: Option<String>,
}

impl FallbackCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        family: impl Into<String>,
        desc: GraphDescription,
    ) -> std::result::Result<(), GraphError> {
        let family = family.into();
        let graph = WorkflowGraph::new(desc)?;
        if self.graphs.insert(family.clone(), Arc::new(graph)).is_none() {
            self.order.push(family);
        }
        Ok(())
    }

    /// Family used when no registered family matches an objective.
    pub fn set_default(&mut self, family: impl Into<String>) {
        self.default_family = Some(family.into());
    }

    pub fn families(&self) -> &[String] {
        &self.order
    }

    /// Family for an objective: exact key, then first registered key the
    /// objective mentions, then the default.
    pub fn family_for(&self, objective: &str) -> Option<&str> {
        let objective = objective.trim().to_lowercase();
        if let Some(key) = self.order.iter().find(|k| k.to_lowercase() == objective) {
            return Some(key.as_str());
        }
        if let Some(key) = self
            .order
            .iter()
            .find(|k| objective.contains(&k.to_lowercase()))
        {
            return Some(key.as_str());
        }
        self.default_family
            .as_deref()
            .filter(|d| self.graphs.contains_key(*d))
    }

    pub fn get(&self, objective: &str) -> Option<(&str, Arc<WorkflowGraph>)> {
        let family = self.family_for(objective)?;
        self.graphs.get(family).map(|g| (family, g.clone()))
    }
}

/// Where a selected graph came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphSource {
    Generated { generator: String },
    Fallback { family: String, reason: Option<String> },
}

pub struct GraphSelection {
    pub graph: Arc<WorkflowGraph>,
    pub source: GraphSource,
}

/// Generate, decode, validate; on any failure use the static graph for the
/// objective's family. Only a missing fallback is an error.
pub async fn from_generator(
    objective: &str,
    capabilities: &[String],
    schema: &GraphSchema,
    generator: Option<&dyn GraphGenerator>,
    fallbacks: &FallbackCatalog,
) -> Result<GraphSelection> {
    let reason = match generator {
        Some(generator) => {
            match try_generate(generator, objective, capabilities, schema).await {
                Ok(graph) => {
                    info!(
                        generator = generator.name(),
                        graph = graph.name(),
                        nodes = graph.nodes().len(),
                        "Using generated workflow graph"
                    );
                    return Ok(GraphSelection {
                        graph: Arc::new(graph),
                        source: GraphSource::Generated {
                            generator: generator.name().to_string(),
                        },
                    });
                }
                Err(e) => {
                    warn!(
                        generator = generator.name(),
                        error = %e,
                        "Graph generation failed, using fallback"
                    );
                    Some(e.to_string())
                }
            }
        }
        None => None,
    };

    let (family, graph) = fallbacks.get(objective).ok_or_else(|| {
        QaflowError::Generator(format!("no fallback graph for objective '{}'", objective))
    })?;
    debug!(family, graph = graph.name(), "Using fallback workflow graph");
    Ok(GraphSelection {
        graph,
        source: GraphSource::Fallback {
            family: family.to_string(),
            reason,
        },
    })
}

async fn try_generate(
    generator: &dyn GraphGenerator,
    objective: &str,
    capabilities: &[String],
    schema: &GraphSchema,
) -> Result<WorkflowGraph> {
    let raw = generator.generate(objective, capabilities, schema).await?;
    let desc = schema.decode(raw)?;
    let graph = WorkflowGraph::new(desc)?;
    graph.validate_steps(capabilities)?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builtin;

    struct Canned(serde_json::Value);

    impl GraphGenerator for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        fn generate<'a>(
            &'a self,
            _objective: &'a str,
            _capabilities: &'a [String],
            _schema: &'a GraphSchema,
        ) -> BoxFuture<'a, Result<serde_json::Value>> {
            let value = self.0.clone();
            Box::pin(async move { Ok(value) })
        }
    }

    fn catalog() -> FallbackCatalog {
        let mut catalog = FallbackCatalog::new();
        catalog
            .register(builtin::APP_CREATION, builtin::app_creation())
            .unwrap();
        catalog
    }

    async fn select_with(gen: &dyn GraphGenerator) -> GraphSelection {
        from_generator("app-creation", &caps(), &GraphSchema::current(), Some(gen), &catalog())
            .await
            .unwrap()
    }

    fn caps() -> Vec<String> {
        vec!["browser_actions".to_string()]
    }

    #[tokio::test]
    async fn test_generated_graph_used_when_valid() {
        let generated = json!({
            "name": "quick",
            "start": "open",
            "phases": [{"name": "Discovery"}],
            "nodes": [
                {"name": "open", "phase": "Discovery", "step": "browser_actions",
                 "transitions": [{"to": "completed"}]}
            ]
        });
        let gen = Canned(generated);
        let sel = select_with(&gen).await;
        assert_eq!(sel.graph.name(), "quick");
        assert_eq!(
            sel.source,
            GraphSource::Generated {
                generator: "canned".into()
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_generated_graph_falls_back() {
        // Not total: no trailing `always`
        let generated = json!({
            "name": "broken",
            "start": "open",
            "phases": [{"name": "Discovery"}],
            "nodes": [
                {"name": "open", "phase": "Discovery", "step": "browser_actions",
                 "transitions": [{"when": "ok exists", "to": "completed"}]}
            ]
        });
        let gen = Canned(generated);
        let sel = select_with(&gen).await;
        assert_eq!(sel.graph.name(), builtin::APP_CREATION);
        match sel.source {
            GraphSource::Fallback { family, reason } => {
                assert_eq!(family, builtin::APP_CREATION);
                assert!(reason.unwrap().contains("not total"));
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_schema_mismatch_falls_back() {
        let gen = Canned(json!({"nodes": "nope"}));
        let sel = select_with(&gen).await;
        assert!(matches!(sel.source, GraphSource::Fallback { .. }));
    }

    #[tokio::test]
    async fn test_unknown_step_falls_back() {
        let generated = json!({
            "name": "needs-more",
            "start": "open",
            "phases": [{"name": "Discovery"}],
            "nodes": [{"name": "open", "phase": "Discovery", "transitions": [{"to": "completed"}]}]
        });
        let gen = Canned(generated);
        let sel = select_with(&gen).await;
        assert!(matches!(sel.source, GraphSource::Fallback { .. }));
    }

    #[tokio::test]
    async fn test_no_fallback_is_error() {
        let catalog = FallbackCatalog::new();
        let schema = GraphSchema::current();
        let err = from_generator("mobile-onboarding", &caps(), &schema, None, &catalog)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QaflowError::Generator(_)));
    }

    #[tokio::test]
    async fn test_file_generator_reads_description() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, serde_json::to_string(&builtin::app_creation()).unwrap()).unwrap();

        let gen = FileGenerator::new(&path);
        let value = gen.generate("x", &[], &GraphSchema::current()).await.unwrap();
        let desc = GraphSchema::current().decode(value).unwrap();
        assert_eq!(desc, builtin::app_creation());

        let missing = FileGenerator::new(dir.path().join("missing.json"));
        assert!(missing.generate("x", &[], &GraphSchema::current()).await.is_err());
    }

    #[test]
    fn test_schema_version_mismatch() {
        let schema = GraphSchema::current();
        let value = json!({
            "name": "g", "schema_version": 9, "start": "a",
            "phases": [], "nodes": []
        });
        assert!(matches!(schema.decode(value), Err(QaflowError::Generator(_))));
    }

    #[test]
    fn test_family_lookup() {
        let mut catalog = catalog();
        assert_eq!(catalog.family_for("App-Creation"), Some(builtin::APP_CREATION));
        assert_eq!(catalog.family_for("full app-creation smoke"), Some(builtin::APP_CREATION));
        assert_eq!(catalog.family_for("billing"), None);
        catalog.set_default(builtin::APP_CREATION);
        assert_eq!(catalog.family_for("billing"), Some(builtin::APP_CREATION));
    }

    #[test]
    fn test_register_rejects_invalid_graph() {
        let mut catalog = FallbackCatalog::new();
        let err = catalog
            .register("empty", GraphDescription::new("empty", "a"))
            .unwrap_err();
        assert_eq!(err, GraphError::Empty);
        assert!(catalog.families().is_empty());
    }
}
