use std::path::Path;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Browser automation primitives (click, type, screenshot, wait-for-element).
///
/// Implementations are shared by every concurrently running session, so they
/// must not keep per-session state outside of what the arguments carry.
pub trait Capabilities: Send + Sync + 'static {
    /// Names of the actions this implementation can perform.
    fn names(&self) -> Vec<String>;

    /// Perform a named action with JSON arguments.
    fn perform(
        &self,
        action: &str,
        args: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Capture evidence (typically a screenshot) into `dir`.
    fn capture<'a>(&'a self, label: &'a str, dir: &'a Path) -> BoxFuture<'a, Result<EvidenceRef>>;

    fn supports(&self, action: &str) -> bool {
        self.names().iter().any(|n| n == action)
    }
}

/// Durable session snapshots keyed by session id.
pub trait SessionStore: Send + Sync + 'static {
    /// Upsert the full snapshot. Lower revisions than the stored one are ignored.
    fn save(&self, session: &Session) -> BoxFuture<'_, Result<()>>;

    fn load(&self, id: &SessionId) -> BoxFuture<'_, Result<Option<Session>>>;

    /// Most recently updated first.
    fn list(&self, limit: usize) -> BoxFuture<'_, Result<Vec<SessionSummary>>>;

    fn count(&self) -> BoxFuture<'_, Result<usize>>;
}
