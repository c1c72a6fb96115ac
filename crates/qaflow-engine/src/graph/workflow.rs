use std::collections::{BTreeMap, HashMap};

use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use qaflow_core::error::GraphError;

use super::node::{Node, Target};
use super::transition::EvalContext;
use super::validate::build_digraph;

/// Named reporting group of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Phase {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Serializable graph, as produced by generators and stored in files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    pub start: String,
    #[serde(default)]
    pub phases: Vec<Phase>,
    pub nodes: Vec<Node>,
}

impl GraphDescription {
    pub fn new(name: impl Into<String>, start: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema_version: None,
            start: start.into(),
            phases: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }
}

/// Outcome of evaluating a node's rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub target: Target,
    /// Index of the transition that fired; `None` for terminal nodes and
    /// exhaustion routing.
    pub rule: Option<usize>,
}

/// A validated, indexed, read-only workflow graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    desc: GraphDescription,
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    pub fn new(desc: GraphDescription) -> Result<Self, GraphError> {
        desc.validate()?;
        let index = desc
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        Ok(Self { desc, index })
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn description(&self) -> &GraphDescription {
        &self.desc
    }

    pub fn start(&self) -> &str {
        &self.desc.start
    }

    pub fn nodes(&self) -> &[Node] {
        &self.desc.nodes
    }

    pub fn phases(&self) -> &[Phase] {
        &self.desc.phases
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.desc.nodes[i])
    }

    pub fn require(&self, name: &str) -> Result<&Node, GraphError> {
        self.node(name)
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    pub fn phase_of(&self, node: &str) -> Option<&Phase> {
        let phase = &self.node(node)?.phase;
        self.desc.phases.iter().find(|p| &p.name == phase)
    }

    pub fn nodes_in_phase(&self, phase: &str) -> Vec<&Node> {
        self.desc.nodes.iter().filter(|n| n.phase == phase).collect()
    }

    /// Pick the next target after `node` succeeded with `result`.
    /// Transitions are tried in declaration order; the first match wins.
    pub fn resolve(
        &self,
        node: &str,
        outputs: &BTreeMap<String, Value>,
        result: &Value,
    ) -> Result<Resolution, GraphError> {
        let node = self.require(node)?;
        if node.terminal {
            return Ok(Resolution {
                target: Target::Completed,
                rule: None,
            });
        }

        let ctx = EvalContext::new(result, outputs);
        node.transitions
            .iter()
            .position(|t| t.when.matches(&ctx))
            .map(|i| Resolution {
                target: node.transitions[i].to.clone(),
                rule: Some(i),
            })
            .ok_or_else(|| GraphError::NonTotal(node.name.clone()))
    }

    /// Routing once `node` has used up its attempts.
    pub fn exhausted(&self, node: &str) -> Result<Resolution, GraphError> {
        Ok(Resolution {
            target: self.require(node)?.on_exhaustion.clone(),
            rule: None,
        })
    }

    /// Every node's step key must be one of `steps`.
    pub fn validate_steps<S: AsRef<str>>(&self, steps: &[S]) -> Result<(), GraphError> {
        for node in &self.desc.nodes {
            let key = node.step_key();
            if !steps.iter().any(|s| s.as_ref() == key) {
                return Err(GraphError::UnknownStep {
                    node: node.name.clone(),
                    step: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Depth-first preorder from the start node. Reporting only; execution
    /// order is decided by transitions at run time.
    pub fn execution_order(&self) -> Vec<&str> {
        let (graph, indices) = build_digraph(&self.desc, true);
        let Some(&start) = self.index.get(&self.desc.start) else {
            return Vec::new();
        };

        let mut dfs = Dfs::new(&graph, indices[start]);
        let mut order = Vec::with_capacity(self.desc.nodes.len());
        while let Some(ix) = dfs.next(&graph) {
            order.push(self.desc.nodes[graph[ix]].name.as_str());
        }
        order
    }

    pub fn summary(&self) -> GraphSummary {
        GraphSummary {
            name: self.desc.name.clone(),
            start: self.desc.start.clone(),
            node_count: self.desc.nodes.len(),
            phases: self
                .desc
                .phases
                .iter()
                .map(|p| PhaseSummary {
                    name: p.name.clone(),
                    nodes: self
                        .nodes_in_phase(&p.name)
                        .into_iter()
                        .map(|n| n.name.clone())
                        .collect(),
                })
                .collect(),
            order: self.execution_order().into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub name: String,
    pub nodes: Vec<String>,
}

/// Reporting view of a graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub name: String,
    pub start: String,
    pub node_count: usize,
    pub phases: Vec<PhaseSummary>,
    pub order: Vec<String>,
}
