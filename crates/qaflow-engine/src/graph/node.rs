use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::transition::{Condition, Transition};

/// Where a transition or exhaustion rule sends the run.
///
/// Serialized as a plain string: `"completed"`, `"failed"`, or a node name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    Node(String),
    Completed,
    #[default]
    Failed,
}

impl Target {
    pub fn node(name: impl Into<String>) -> Self {
        Target::Node(name.into())
    }

    pub fn node_name(&self) -> Option<&str> {
        match self {
            Target::Node(n) => Some(n),
            _ => None,
        }
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        match s.as_str() {
            "completed" => Target::Completed,
            "failed" => Target::Failed,
            _ => Target::Node(s),
        }
    }
}

impl From<Target> for String {
    fn from(t: Target) -> Self {
        t.to_string()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Node(n) => f.write_str(n),
            Target::Completed => f.write_str("completed"),
            Target::Failed => f.write_str("failed"),
        }
    }
}

/// Per-node retry behaviour. Attempts are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Randomize each delay by up to 25%.
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff_ms: u64, multiplier: f64) -> Self {
        self.backoff_ms = backoff_ms;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before attempt `failed_attempt + 1`:
    /// `backoff_ms * multiplier^(failed_attempt - 1)`, capped at `max_backoff_ms`.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(63) as i32;
        let raw = self.backoff_ms as f64 * self.backoff_multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0) as u64;

        let ms = if self.jitter && capped > 0 {
            let spread = capped / 4;
            let jitter = rand::thread_rng().gen_range(0..=spread);
            capped - spread / 2 + jitter
        } else {
            capped
        };
        Duration::from_millis(ms)
    }
}

/// A single step of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique name within the graph.
    pub name: String,
    /// Declared phase this node reports under.
    pub phase: String,
    /// Key into the step registry. Defaults to the node name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Ordered browser actions performed by the generic action step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    /// Evaluated in order after success; first match wins.
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Where to go once all attempts have failed.
    #[serde(default)]
    pub on_exhaustion: Target,
    /// Reaching this node and succeeding completes the run.
    #[serde(default)]
    pub terminal: bool,
}

impl Node {
    pub fn new(name: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: phase.into(),
            step: None,
            description: String::new(),
            actions: Vec::new(),
            transitions: Vec::new(),
            retry: RetryPolicy::default(),
            on_exhaustion: Target::Failed,
            terminal: false,
        }
    }

    /// Step registry key for this node.
    pub fn step_key(&self) -> &str {
        self.step.as_deref().unwrap_or(&self.name)
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_actions(mut self, actions: &[&str]) -> Self {
        self.actions = actions.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_exhaustion(mut self, target: Target) -> Self {
        self.on_exhaustion = target;
        self
    }

    /// Append a conditional transition.
    pub fn when(mut self, expr: impl Into<String>, target: Target) -> Self {
        self.transitions.push(Transition::new(Condition::expr(expr), target));
        self
    }

    /// Append the default (`always`) transition.
    pub fn then(mut self, target: Target) -> Self {
        self.transitions.push(Transition::new(Condition::Always, target));
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Whether the only way out of this node on success is a single
    /// unconditional edge to another node.
    pub(crate) fn unconditional_successor(&self) -> Option<&str> {
        match self.transitions.as_slice() {
            [only] if only.when.is_always() => only.to.node_name(),
            _ => None,
        }
    }
}
