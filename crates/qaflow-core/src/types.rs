use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QaflowError, Result};

/// Unique session identifier.
///
/// Format: `qa-session-{unix_seconds}-{16 hex}`. The timestamp orders ids by
/// creation time and the random suffix avoids collisions without coordination.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "qa-session-{}-{}",
            Utc::now().timestamp(),
            &suffix[..16]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Status only moves forward, except `active -> paused -> active`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Failed)
                | (Paused, Active)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = QaflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(SessionStatus::Created),
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(QaflowError::Persistence(format!(
                "unknown session status: {}",
                other
            ))),
        }
    }
}

/// How a run of the engine ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Paused,
}

impl From<RunStatus> for SessionStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Completed => SessionStatus::Completed,
            RunStatus::Failed => SessionStatus::Failed,
            RunStatus::Paused => SessionStatus::Paused,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        SessionStatus::from(*self).fmt(f)
    }
}

/// Reference to a captured piece of evidence (screenshot, page dump, log).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub kind: String,
    pub label: String,
    pub path: PathBuf,
    #[serde(default)]
    pub node: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl EvidenceRef {
    pub fn new(
        kind: impl Into<String>,
        label: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind: kind.into(),
            label: label.into(),
            path: path.into(),
            node: None,
            captured_at: Utc::now(),
        }
    }
}

/// A failed step attempt, kept for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub node: String,
    pub attempt: u32,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Complete state of one QA run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub label: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub status: SessionStatus,
    /// Result payload per step.
    #[serde(default)]
    pub results: BTreeMap<String, serde_json::Value>,
    /// Evidence per phase, in capture order.
    #[serde(default)]
    pub evidence: BTreeMap<String, Vec<EvidenceRef>>,
    /// Named outputs produced by completed steps.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub executed_nodes: Vec<String>,
    #[serde(default)]
    pub failed_nodes: Vec<String>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    /// Elapsed milliseconds of the last attempt per step.
    #[serde(default)]
    pub step_timings: BTreeMap<String, u64>,
    /// External automation instance (browser handle).
    #[serde(default)]
    pub automation_handle: Option<String>,
    pub artifacts_dir: PathBuf,
    /// Graph last executed against this session.
    #[serde(default)]
    pub workflow: Option<String>,
    /// Next node to execute when the session is resumed.
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub current_phase: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    /// Bumped on every published change; the store never goes backwards.
    #[serde(default)]
    pub revision: u64,
}

impl Session {
    pub fn new(id: SessionId, label: impl Into<String>, artifacts_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            label: label.into(),
            owner: None,
            status: SessionStatus::Created,
            results: BTreeMap::new(),
            evidence: BTreeMap::new(),
            outputs: BTreeMap::new(),
            executed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            errors: Vec::new(),
            step_timings: BTreeMap::new(),
            automation_handle: None,
            artifacts_dir,
            workflow: None,
            current_node: None,
            current_phase: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            archived_at: None,
            revision: 0,
        }
    }

    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    /// Move to `next`, enforcing the forward-only lifecycle.
    pub fn set_status(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(QaflowError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        match next {
            SessionStatus::Active if self.started_at.is_none() => self.started_at = Some(now),
            SessionStatus::Completed | SessionStatus::Failed => self.finished_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Record a successful step: store its payload, merge object fields into
    /// outputs and append the node to `executed_nodes` once.
    pub fn record_success(&mut self, node: &str, result: serde_json::Value) {
        if let Some(obj) = result.as_object() {
            for (key, value) in obj {
                self.outputs.insert(key.clone(), value.clone());
            }
        }
        self.results.insert(node.to_string(), result);
        if !self.executed_nodes.iter().any(|n| n == node) {
            self.executed_nodes.push(node.to_string());
        }
    }

    /// Record an exhausted step; appears in `failed_nodes` at most once.
    pub fn record_failure(&mut self, node: &str) {
        if !self.failed_nodes.iter().any(|n| n == node) {
            self.failed_nodes.push(node.to_string());
        }
    }

    pub fn push_error(&mut self, node: &str, attempt: u32, message: impl Into<String>) {
        self.errors.push(ErrorRecord {
            node: node.to_string(),
            attempt,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn add_evidence(&mut self, phase: &str, refs: Vec<EvidenceRef>) {
        if refs.is_empty() {
            return;
        }
        self.evidence.entry(phase.to_string()).or_default().extend(refs);
    }

    pub fn evidence_count(&self) -> usize {
        self.evidence.values().map(Vec::len).sum()
    }

    /// Mark a new revision of this session.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }

    pub fn summary(&self, leased: bool) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            label: self.label.clone(),
            status: self.status,
            current_phase: self.current_phase.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            executed: self.executed_nodes.len(),
            failed: self.failed_nodes.len(),
            evidence: self.evidence_count(),
            errors: self.errors.len(),
            leased,
        }
    }
}

/// Compact view of a session for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub label: String,
    pub status: SessionStatus,
    pub current_phase: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed: usize,
    pub failed: usize,
    pub evidence: usize,
    pub errors: usize,
    /// Whether an execution context currently holds the session.
    #[serde(default)]
    pub leased: bool,
}

/// Portable export of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub session: Session,
}

impl SessionSnapshot {
    pub const FORMAT_VERSION: u32 = 1;

    pub fn new(session: Session) -> Self {
        Self {
            format_version: Self::FORMAT_VERSION,
            exported_at: Utc::now(),
            session,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: SessionSnapshot = serde_json::from_str(json)?;
        if snapshot.format_version > Self::FORMAT_VERSION {
            return Err(QaflowError::Persistence(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }
        Ok(snapshot)
    }
}

/// Events emitted while a session runs through a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Engine took the lease and is about to execute `node`.
    RunStarted {
        session_id: SessionId,
        workflow: String,
        node: String,
    },
    StepStarted {
        session_id: SessionId,
        node: String,
        phase: String,
        attempt: u32,
    },
    StepCompleted {
        session_id: SessionId,
        node: String,
        elapsed_ms: u64,
    },
    StepFailed {
        session_id: SessionId,
        node: String,
        attempt: u32,
        error: String,
    },
    StepRetrying {
        session_id: SessionId,
        node: String,
        next_attempt: u32,
        backoff_ms: u64,
    },
    /// A transition rule fired. `to` is a node name, `completed` or `failed`.
    Transition {
        session_id: SessionId,
        from: String,
        to: String,
        rule: Option<usize>,
    },
    Checkpointed {
        session_id: SessionId,
        phase: Option<String>,
        revision: u64,
    },
    RunPaused {
        session_id: SessionId,
        resume_at: Option<String>,
    },
    RunFinished {
        session_id: SessionId,
        status: RunStatus,
        elapsed_ms: u64,
    },
}

impl WorkflowEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            WorkflowEvent::RunStarted { session_id, .. }
            | WorkflowEvent::StepStarted { session_id, .. }
            | WorkflowEvent::StepCompleted { session_id, .. }
            | WorkflowEvent::StepFailed { session_id, .. }
            | WorkflowEvent::StepRetrying { session_id, .. }
            | WorkflowEvent::Transition { session_id, .. }
            | WorkflowEvent::Checkpointed { session_id, .. }
            | WorkflowEvent::RunPaused { session_id, .. }
            | WorkflowEvent::RunFinished { session_id, .. } => session_id,
        }
    }

    /// Short event name used in run logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::RunStarted { .. } => "run_started",
            WorkflowEvent::StepStarted { .. } => "step_started",
            WorkflowEvent::StepCompleted { .. } => "step_completed",
            WorkflowEvent::StepFailed { .. } => "step_failed",
            WorkflowEvent::StepRetrying { .. } => "step_retrying",
            WorkflowEvent::Transition { .. } => "transition",
            WorkflowEvent::Checkpointed { .. } => "checkpointed",
            WorkflowEvent::RunPaused { .. } => "run_paused",
            WorkflowEvent::RunFinished { .. } => "run_finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionId::new(), "checkout", PathBuf::from("/tmp/qa"))
    }

    #[test]
    fn test_session_id_format() {
        let id = SessionId::new();
        let parts: Vec<&str> = id.as_str().splitn(4, '-').collect();
        assert_eq!(parts[0], "qa");
        assert_eq!(parts[1], "session");
        assert!(parts[2].parse::<i64>().is_ok());
        assert_eq!(parts[3].len(), 16);
    }

    #[test]
    fn test_status_transitions() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Failed.can_transition_to(Paused));
        assert!(!Created.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn test_set_status_rejects_backwards_move() {
        let mut s = session();
        s.set_status(SessionStatus::Active).unwrap();
        assert!(s.started_at.is_some());
        s.set_status(SessionStatus::Completed).unwrap();
        assert!(s.finished_at.is_some());

        let err = s.set_status(SessionStatus::Active).unwrap_err();
        assert!(matches!(err, QaflowError::InvalidTransition { .. }));
        assert_eq!(s.status, SessionStatus::Completed);
    }

    #[test]
    fn test_record_success_merges_outputs_once() {
        let mut s = session();
        s.record_success("login", serde_json::json!({"user": "qa-bot", "ok": true}));
        s.record_success("login", serde_json::json!({"user": "qa-bot-2"}));

        assert_eq!(s.executed_nodes, vec!["login"]);
        assert_eq!(s.outputs["user"], serde_json::json!("qa-bot-2"));
        assert_eq!(s.outputs["ok"], serde_json::json!(true));
        assert_eq!(s.results["login"], serde_json::json!({"user": "qa-bot-2"}));
    }

    #[test]
    fn test_record_failure_deduplicates() {
        let mut s = session();
        s.record_failure("submit");
        s.record_failure("submit");
        assert_eq!(s.failed_nodes, vec!["submit"]);
    }

    #[test]
    fn test_evidence_grouped_by_phase() {
        let mut s = session();
        s.add_evidence("Discovery", vec![EvidenceRef::new("screenshot", "login", "a.png")]);
        s.add_evidence("Discovery", vec![EvidenceRef::new("screenshot", "form", "b.png")]);
        s.add_evidence("Build", vec![]);
        assert_eq!(s.evidence["Discovery"].len(), 2);
        assert!(!s.evidence.contains_key("Build"));
        assert_eq!(s.evidence_count(), 2);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut s = session();
        s.set_status(SessionStatus::Active).unwrap();
        s.record_success("login", serde_json::json!({"token": "abc"}));
        s.add_evidence("Discovery", vec![EvidenceRef::new("screenshot", "login", "a.png")]);
        s.push_error("submit", 1, "button missing");
        s.touch();

        let json = SessionSnapshot::new(s.clone()).to_json().unwrap();
        let back = SessionSnapshot::from_json(&json).unwrap();
        assert_eq!(back.session, s);
    }

    #[test]
    fn test_snapshot_rejects_future_format() {
        let mut snap = SessionSnapshot::new(session());
        snap.format_version = 99;
        let json = serde_json::to_string(&snap).unwrap();
        assert!(SessionSnapshot::from_json(&json).is_err());
    }
}
