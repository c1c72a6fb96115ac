use tokio::sync::broadcast::{self, error::RecvError};

use crate::types::{SessionId, WorkflowEvent};

/// Broadcast bus for workflow events. Every subscriber sees every session's
/// events; `subscribe_session` narrows that to one run.
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Events for one session only, starting from now.
    pub fn subscribe_session(&self, session_id: SessionId) -> SessionEvents {
        SessionEvents {
            rx: self.tx.subscribe(),
            session_id,
            skipped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiver filtered to a single session.
pub struct SessionEvents {
    rx: broadcast::Receiver<WorkflowEvent>,
    session_id: SessionId,
    skipped: u64,
}

impl SessionEvents {
    /// Next event for the session, or `None` once the bus is gone. Events
    /// lost to lag are counted in `skipped` and passed over. Cancel-safe.
    pub async fn recv(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.session_id() == &self.session_id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => self.skipped += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Events dropped because this receiver fell behind (any session).
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
