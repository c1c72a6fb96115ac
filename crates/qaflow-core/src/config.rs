use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{QaflowError, Result};
use crate::types::SessionId;

/// Top-level qaflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root for the session database and per-session results.
    #[serde(default = "default_workspace")]
    pub dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_workspace(),
        }
    }
}

/// In-memory session retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Sessions kept in memory before least-recently-used eviction.
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Sessions older than this are evicted from memory by cleanup.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
    /// Drop completed/failed sessions from memory once persisted.
    #[serde(default)]
    pub evict_finished: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_active: default_max_active(),
            max_age_days: default_max_age_days(),
            evict_finished: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// A node visited more often than this in one run fails the run.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,
    /// Per-attempt step timeout (0 = none).
    #[serde(default)]
    pub step_timeout_secs: u64,
    /// Capacity of the workflow event bus.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_node_visits: default_max_node_visits(),
            step_timeout_secs: 0,
            event_buffer: default_event_buffer(),
        }
    }
}

/// Graph generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Pre-generated graph description (JSON) to try before the fallback.
    #[serde(default)]
    pub graph_file: Option<String>,
    /// Objective used when the CLI is not given one.
    #[serde(default = "default_objective")]
    pub objective: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            graph_file: None,
            objective: default_objective(),
        }
    }
}

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 1 = run start/finish only, 2 = plus steps and transitions, 3 = everything.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            level: default_log_level(),
        }
    }
}

fn default_workspace() -> String { "~/.qaflow".to_string() }
fn default_max_active() -> usize { 100 }
fn default_max_age_days() -> u64 { 7 }
fn default_max_node_visits() -> u32 { 5 }
fn default_event_buffer() -> usize { 256 }
fn default_objective() -> String { "app-creation".to_string() }
fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| QaflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${VAR} and ${VAR:-fallback} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| QaflowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_node_visits == 0 {
            return Err(QaflowError::Config(
                "engine.max_node_visits must be at least 1".to_string(),
            ));
        }
        if self.engine.event_buffer == 0 {
            return Err(QaflowError::Config(
                "engine.event_buffer must be at least 1".to_string(),
            ));
        }
        if !(1..=3).contains(&self.log.level) {
            return Err(QaflowError::Config(format!(
                "log.level must be 1, 2 or 3 (got {})",
                self.log.level
            )));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.workspace.dir;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    pub fn store_path(&self) -> PathBuf {
        self.workspace_dir().join("sessions.db")
    }

    pub fn results_root(&self) -> PathBuf {
        self.workspace_dir().join("results")
    }

    pub fn artifacts_dir_for(&self, label: &str, id: &SessionId) -> PathBuf {
        artifacts_dir_in(&self.results_root(), label, id)
    }
}

/// Artifacts directory for a new session: `<root>/<label>_<timestamp>_<id tail>`.
/// The id tail keeps same-label sessions started in the same second apart.
pub fn artifacts_dir_in(root: &Path, label: &str, id: &SessionId) -> PathBuf {
    let safe: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let id = id.as_str();
    let tail = id.char_indices().rev().nth(7).map_or(id, |(i, _)| &id[i..]);
    root.join(format!(
        "{}_{}_{}",
        safe,
        Utc::now().format("%Y%m%d_%H%M%S"),
        tail
    ))
}

/// Substitute `${VAR}` and `${VAR:-fallback}` from the environment. Unset
/// variables without a fallback, and an unterminated `${`, stay as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let reference = &after[..end];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };
        // An empty value counts as unset when a fallback is given
        let value = std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty() || fallback.is_none());
        match (value, fallback) {
            (Some(value), _) => out.push_str(&value),
            (None, Some(fallback)) => out.push_str(fallback),
            (None, None) => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
