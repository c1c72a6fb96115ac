use std::collections::{HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use qaflow_core::error::GraphError;

use super::node::Target;
use super::transition::{Condition, Predicate};
use super::workflow::GraphDescription;

/// Build a petgraph view of the description. Node weights index into
/// `desc.nodes`; edges to unknown names are skipped.
pub(crate) fn build_digraph(
    desc: &GraphDescription,
    include_exhaustion: bool,
) -> (DiGraph<usize, ()>, Vec<NodeIndex>) {
    let mut graph = DiGraph::with_capacity(desc.nodes.len(), desc.nodes.len() * 2);
    let indices: Vec<NodeIndex> = (0..desc.nodes.len()).map(|i| graph.add_node(i)).collect();
    let by_name: HashMap<&str, NodeIndex> = desc
        .nodes
        .iter()
        .zip(&indices)
        .map(|(n, &ix)| (n.name.as_str(), ix))
        .collect();

    for (node, &from) in desc.nodes.iter().zip(&indices) {
        let exhaustion = include_exhaustion.then_some(&node.on_exhaustion);
        let targets = node.transitions.iter().map(|t| &t.to).chain(exhaustion);
        for target in targets {
            if let Some(&to) = target.node_name().and_then(|n| by_name.get(n)) {
                graph.add_edge(from, to, ());
            }
        }
    }
    (graph, indices)
}

impl GraphDescription {
    /// Check every structural invariant. The first violation found is
    /// returned; checks run cheapest first.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut phases = HashSet::new();
        for phase in &self.phases {
            if !phases.insert(phase.name.as_str()) {
                return Err(GraphError::DuplicatePhase(phase.name.clone()));
            }
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }

        if !names.contains(self.start.as_str()) {
            return Err(GraphError::MissingStart(self.start.clone()));
        }

        for node in &self.nodes {
            if !phases.contains(node.phase.as_str()) {
                return Err(GraphError::UnknownPhase {
                    node: node.name.clone(),
                    phase: node.phase.clone(),
                });
            }

            let retry = &node.retry;
            if retry.max_attempts == 0 || !retry.backoff_multiplier.is_finite() {
                return Err(GraphError::InvalidRetry(node.name.clone()));
            }

            if node.terminal {
                if !node.transitions.is_empty() {
                    return Err(GraphError::TerminalWithTransitions(node.name.clone()));
                }
            } else if !node.transitions.last().is_some_and(|t| t.when.is_always()) {
                return Err(GraphError::NonTotal(node.name.clone()));
            }

            let targets = node
                .transitions
                .iter()
                .map(|t| &t.to)
                .chain(std::iter::once(&node.on_exhaustion));
            for target in targets {
                if let Target::Node(name) = target {
                    if !names.contains(name.as_str()) {
                        return Err(GraphError::UnknownTarget {
                            node: node.name.clone(),
                            target: name.clone(),
                        });
                    }
                }
            }

            for t in &node.transitions {
                if let Condition::Expr(expr) = &t.when {
                    if Predicate::parse(expr).is_none() {
                        return Err(GraphError::InvalidCondition {
                            node: node.name.clone(),
                            expr: expr.clone(),
                        });
                    }
                }
            }
        }

        self.check_reachable()?;
        self.check_unconditional_cycles()
    }

    fn check_reachable(&self) -> Result<(), GraphError> {
        let (graph, indices) = build_digraph(self, true);
        let start = self
            .nodes
            .iter()
            .position(|n| n.name == self.start)
            .ok_or_else(|| GraphError::MissingStart(self.start.clone()))?;

        let mut seen = vec![false; self.nodes.len()];
        let mut dfs = Dfs::new(&graph, indices[start]);
        while let Some(ix) = dfs.next(&graph) {
            seen[graph[ix]] = true;
        }

        match seen.iter().position(|reached| !reached) {
            Some(i) => Err(GraphError::Unreachable(self.nodes[i].name.clone())),
            None => Ok(()),
        }
    }

    /// A cycle is only a problem when every edge on it is the sole,
    /// unconditional way out of its node.
    fn check_unconditional_cycles(&self) -> Result<(), GraphError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();
        let by_name: HashMap<&str, NodeIndex> = self
            .nodes
            .iter()
            .zip(&indices)
            .map(|(n, &ix)| (n.name.as_str(), ix))
            .collect();

        for (node, &from) in self.nodes.iter().zip(&indices) {
            if let Some(&to) = node.unconditional_successor().and_then(|n| by_name.get(n)) {
                graph.add_edge(from, to, ());
            }
        }

        for scc in tarjan_scc(&graph) {
            let looped = scc.len() > 1 || graph.contains_edge(scc[0], scc[0]);
            if looped {
                let mut members: Vec<usize> = scc.iter().map(|&ix| graph[ix]).collect();
                members.sort_unstable();
                return Err(GraphError::UnconditionalCycle(
                    members.into_iter().map(|i| self.nodes[i].name.clone()).collect(),
                ));
            }
        }
        Ok(())
    }
}
