use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use qaflow_core::error::{QaflowError, Result};
use qaflow_core::traits::Capabilities;
use qaflow_core::types::EvidenceRef;

/// Generic browser primitives every capability set is expected to offer.
const PRIMITIVES: &[&str] = &["open", "click", "type", "wait_for_element", "screenshot"];

/// Simulated browser. Accepts any action name, succeeds after a short pause
/// unless the action was named with `--fail-action`, and writes a small JSON
/// placeholder as evidence.
pub struct DryRunCapabilities {
    fail_action: Option<String>,
    latency: Duration,
}

impl DryRunCapabilities {
    pub fn new(fail_action: Option<String>, latency_ms: u64) -> Self {
        Self {
            fail_action,
            latency: Duration::from_millis(latency_ms),
        }
    }
}

impl Capabilities for DryRunCapabilities {
    fn names(&self) -> Vec<String> {
        PRIMITIVES.iter().map(|a| a.to_string()).collect()
    }

    fn supports(&self, _action: &str) -> bool {
        true
    }

    fn perform(&self, action: &str, args: Value) -> BoxFuture<'_, Result<Value>> {
        let action = action.to_string();
        Box::pin(async move {
            tokio::time::sleep(self.latency).await;
            if self.fail_action.as_deref() == Some(action.as_str()) {
                return Err(QaflowError::StepFailure {
                    node: args["node"].as_str().unwrap_or_default().to_string(),
                    message: format!("simulated failure of {}", action),
                });
            }
            debug!(action = %action, "Simulated action");
            Ok(json!({ "action": action, "simulated": true }))
        })
    }

    fn capture<'a>(&'a self, label: &'a str, dir: &'a Path) -> BoxFuture<'a, Result<EvidenceRef>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(dir).await?;
            let path = dir.join(format!("{}.json", label));
            let body = json!({
                "label": label,
                "captured_at": chrono::Utc::now().to_rfc3339(),
                "note": "dry run placeholder",
            });
            tokio::fs::write(&path, serde_json::to_vec_pretty(&body)?).await?;
            Ok(EvidenceRef::new("placeholder", label, path))
        })
    }
}
