use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use qaflow_core::event::{EventBus, SessionEvents};
use qaflow_core::types::{SessionId, WorkflowEvent};

/// JSONL run logger.
///
/// Follows the event bus for one session and appends one JSON object per
/// line to `{log_dir}/{timestamp}.jsonl`. Lines already written survive a
/// crash mid-run.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    session_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run start/pause/finish, 2 = plus step
    /// results and transitions, 3 = everything.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in a background task, so no event published
    /// after this call is missed. The task ends on `RunFinished` for the
    /// session, on cancellation once the backlog is drained, or when the bus closes.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let events = event_bus.subscribe_session(session_id);
        tokio::spawn(self.run(events, cancel))
    }

    async fn run(self, mut events: SessionEvents, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = self.log_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(
            session_id = %events.session_id(),
            path = %log_path.display(),
            "RunLogger started"
        );
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            let event = tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            };

            if let Some(entry) = self.event_to_entry(&event) {
                if let Ok(json) = serde_json::to_string(&entry) {
                    let line = format!("{}\n", json);
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write log entry");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        error!(error = %e, "Failed to flush log");
                    }
                }
            }
            if matches!(event, WorkflowEvent::RunFinished { .. }) {
                break;
            }
        }

        writer.flush().await.ok();
        if events.skipped() > 0 {
            warn!(skipped = events.skipped(), "RunLogger fell behind, events missing from log");
        }
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry, or `None` if filtered out by level.
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let (node, detail) = match event {
            // L1: run summary
            WorkflowEvent::RunStarted { workflow, node, .. } => {
                (Some(node.clone()), Some(serde_json::json!({ "workflow": workflow })))
            }
            WorkflowEvent::RunPaused { resume_at, .. } => (resume_at.clone(), None),
            WorkflowEvent::RunFinished { status, elapsed_ms, .. } => (
                None,
                Some(serde_json::json!({ "status": status, "elapsed_ms": elapsed_ms })),
            ),

            // L2: step results and routing
            WorkflowEvent::StepCompleted { node, elapsed_ms, .. } if self.level >= 2 => {
                (Some(node.clone()), Some(serde_json::json!({ "elapsed_ms": elapsed_ms })))
            }
            WorkflowEvent::StepFailed { node, attempt, error, .. } if self.level >= 2 => (
                Some(node.clone()),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "error": truncate_str(error, 500),
                })),
            ),
            WorkflowEvent::Transition { from, to, rule, .. } if self.level >= 2 => (
                Some(from.clone()),
                Some(serde_json::json!({ "to": to, "rule": rule })),
            ),
            WorkflowEvent::Checkpointed { phase, revision, .. } if self.level >= 2 => (
                None,
                Some(serde_json::json!({ "phase": phase, "revision": revision })),
            ),

            // L3: attempts and backoff
            WorkflowEvent::StepStarted { node, phase, attempt, .. } if self.level >= 3 => (
                Some(node.clone()),
                Some(serde_json::json!({ "phase": phase, "attempt": attempt })),
            ),
            WorkflowEvent::StepRetrying {
                node,
                next_attempt,
                backoff_ms,
                ..
            } if self.level >= 3 => (
                Some(node.clone()),
                Some(serde_json::json!({ "next_attempt": next_attempt, "backoff_ms": backoff_ms })),
            ),

            _ => return None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            session_id: event.session_id().to_string(),
            event_type: event.kind().to_string(),
            node,
            detail,
        })
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
