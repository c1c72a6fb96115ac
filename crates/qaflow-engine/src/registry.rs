use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use qaflow_core::config::{artifacts_dir_in, RegistryConfig};
use qaflow_core::error::{QaflowError, Result};
use qaflow_core::traits::SessionStore;
use qaflow_core::types::{Session, SessionId, SessionSnapshot, SessionStatus, SessionSummary};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One in-memory session. Readers clone the `Arc` snapshot; the lease holder
/// replaces it wholesale on commit.
struct Slot {
    snapshot: RwLock<Arc<Session>>,
    lease: Mutex<Option<Uuid>>,
    last_access: Mutex<Instant>,
    /// Orders checkpoints of this session.
    persist: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            snapshot: RwLock::new(Arc::new(session)),
            lease: Mutex::new(None),
            last_access: Mutex::new(Instant::now()),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Arc<Session> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish(&self, session: Arc<Session>) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = session;
    }

    fn is_leased(&self) -> bool {
        lock(&self.lease).is_some()
    }

    fn touch(&self) {
        *lock(&self.last_access) = Instant::now();
    }

    fn last_access(&self) -> Instant {
        *lock(&self.last_access)
    }
}

/// Exclusive right to execute a session. Dropping it releases the session.
pub struct Lease {
    id: SessionId,
    token: Uuid,
    slot: Arc<Slot>,
}

impl Lease {
    pub fn session_id(&self) -> &SessionId {
        &self.id
    }

    fn is_held(&self) -> bool {
        *lock(&self.slot.lease) == Some(self.token)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut held = lock(&self.slot.lease);
        if *held == Some(self.token) {
            *held = None;
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("session_id", &self.id)
            .field("token", &self.token)
            .finish()
    }
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub evicted_by_age: Vec<SessionId>,
    pub evicted_by_capacity: Vec<SessionId>,
    pub skipped_leased: usize,
    /// Sessions kept because their checkpoint failed.
    pub failed: Vec<(SessionId, String)>,
    pub remaining: usize,
}

impl CleanupReport {
    pub fn evicted(&self) -> usize {
        self.evicted_by_age.len() + self.evicted_by_capacity.len()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub in_memory: usize,
    pub leased: usize,
    pub stored: usize,
    /// In-memory sessions per status.
    pub by_status: BTreeMap<String, usize>,
}

/// Concurrent session registry: O(1) lookup by id, lazy loading from the
/// store, at most one execution lease per session.
pub struct SessionRegistry {
    slots: DashMap<SessionId, Arc<Slot>>,
    store: Arc<dyn SessionStore>,
    config: RegistryConfig,
    results_root: PathBuf,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        config: RegistryConfig,
        results_root: PathBuf,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            store,
            config,
            results_root,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the session is currently held in memory.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.slots.contains_key(id)
    }

    fn slot(&self, id: &SessionId) -> Option<Arc<Slot>> {
        self.slots.get(id).map(|entry| entry.value().clone())
    }

    async fn slot_or_load(&self, id: &SessionId) -> Result<Arc<Slot>> {
        if let Some(slot) = self.slot(id) {
            slot.touch();
            return Ok(slot);
        }

        let loaded = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| QaflowError::SessionNotFound(id.to_string()))?;
        debug!(session_id = %id, revision = loaded.revision, "Session loaded from store");

        // A concurrent load may have won; keep whichever got in first
        let slot = self
            .slots
            .entry(id.clone())
            .or_insert_with(|| Slot::new(loaded))
            .value()
            .clone();
        slot.touch();
        Ok(slot)
    }

    /// Register a new session. No I/O.
    #[instrument(skip(self, owner))]
    pub fn create(&self, label: &str, owner: Option<String>) -> SessionId {
        loop {
            let id = SessionId::new();
            match self.slots.entry(id.clone()) {
                Entry::Occupied(_) => {
                    warn!(session_id = %id, "Session id collision, generating another");
                }
                Entry::Vacant(vacant) => {
                    let dir = artifacts_dir_in(&self.results_root, label, &id);
                    let session = Session::new(id.clone(), label, dir).with_owner(owner);
                    vacant.insert(Slot::new(session));
                    info!(session_id = %id, "Session created");
                    return id;
                }
            }
        }
    }

    /// Current snapshot, loading from the store if not in memory.
    pub async fn get(&self, id: &SessionId) -> Result<Arc<Session>> {
        Ok(self.slot_or_load(id).await?.snapshot())
    }

    /// Mark the session active and hand out its lease plus a working copy.
    /// Fails with `SessionConflict` while another lease is held.
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn activate(&self, id: &SessionId) -> Result<(Lease, Session)> {
        loop {
            self.slot_or_load(id).await?;

            // Hold the map entry so cleanup cannot evict between check and lease
            let Some(entry) = self.slots.get(id) else {
                continue;
            };
            let slot = entry.value().clone();
            let mut held = lock(&slot.lease);
            if held.is_some() {
                warn!("Session already leased");
                return Err(QaflowError::SessionConflict(id.to_string()));
            }

            let current = slot.snapshot();
            let mut working = (*current).clone();
            if current.status == SessionStatus::Active {
                debug!("Re-activating session left active without a lease");
            } else {
                working.set_status(SessionStatus::Active)?;
            }
            working.touch();
            slot.publish(Arc::new(working.clone()));

            let token = Uuid::new_v4();
            *held = Some(token);
            drop(held);
            drop(entry);

            info!(revision = working.revision, "Session activated");
            return Ok((
                Lease {
                    id: id.clone(),
                    token,
                    slot,
                },
                working,
            ));
        }
    }

    /// Publish the lease holder's working copy as the new snapshot.
    pub fn commit(&self, lease: &Lease, session: &mut Session) -> Result<()> {
        if session.id != lease.id || !lease.is_held() {
            return Err(QaflowError::SessionConflict(lease.id.to_string()));
        }
        session.touch();
        lease.slot.publish(Arc::new(session.clone()));
        Ok(())
    }

    /// Persist the current snapshot. Returns the stored revision.
    pub async fn checkpoint(&self, id: &SessionId) -> Result<u64> {
        let slot = self
            .slot(id)
            .ok_or_else(|| QaflowError::SessionNotFound(id.to_string()))?;
        self.persist(&slot).await
    }

    async fn persist(&self, slot: &Slot) -> Result<u64> {
        let _ordered = slot.persist.lock().await;
        let snapshot = slot.snapshot();
        self.store.save(&snapshot).await.map_err(|e| match e {
            QaflowError::Persistence(_) => e,
            other => QaflowError::Persistence(other.to_string()),
        })?;
        debug!(session_id = %snapshot.id, revision = snapshot.revision, "Session checkpointed");
        Ok(snapshot.revision)
    }

    /// Apply the final status, publish, persist and release. If persisting
    /// fails the session is put back to `active` so it can be resumed.
    #[instrument(skip_all, fields(session_id = %lease.id, status = %status))]
    pub async fn deactivate(
        &self,
        lease: Lease,
        mut session: Session,
        status: SessionStatus,
    ) -> Result<Arc<Session>> {
        session.set_status(status)?;
        self.commit(&lease, &mut session)?;

        if let Err(e) = self.persist(&lease.slot).await {
            warn!(error = %e, "Final checkpoint failed, leaving session active");
            session.status = SessionStatus::Active;
            session.finished_at = None;
            session.touch();
            lease.slot.publish(Arc::new(session));
            return Err(e);
        }

        let snapshot = lease.slot.snapshot();
        drop(lease);

        if self.config.evict_finished && status.is_finished() {
            self.slots.remove_if(&snapshot.id, |_, slot| !slot.is_leased());
            debug!("Finished session evicted from memory");
        }
        info!(revision = snapshot.revision, "Session deactivated");
        Ok(snapshot)
    }

    /// Drop a lease without touching status.
    pub fn release(&self, lease: Lease) {
        debug!(session_id = %lease.id, "Lease released");
        drop(lease);
    }

    pub fn list_active(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .slots
            .iter()
            .map(|entry| {
                let slot = entry.value();
                slot.snapshot().summary(slot.is_leased())
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// In-memory and stored sessions, in-memory state winning.
    pub async fn list_all(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let mut merged: HashMap<SessionId, SessionSummary> = self
            .store
            .list(limit)
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        for summary in self.list_active() {
            merged.insert(summary.id.clone(), summary);
        }

        let mut all: Vec<SessionSummary> = merged.into_values().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all.truncate(limit);
        Ok(all)
    }

    /// Evict sessions older than `max_age_days` (0 disables), then the least
    /// recently used until at most `max_active` remain. Leased sessions stay;
    /// every evicted session is checkpointed first and stays in the store.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, max_active: usize, max_age_days: u64) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = (max_age_days > 0)
            .then(|| Utc::now() - chrono::Duration::days(max_age_days.min(36_500) as i64));

        let slots: Vec<(SessionId, Arc<Slot>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut survivors = Vec::new();
        for (id, slot) in slots {
            if slot.is_leased() {
                report.skipped_leased += 1;
                continue;
            }
            let snapshot = slot.snapshot();
            if cutoff.is_some_and(|c| snapshot.created_at < c) {
                if snapshot.status.is_finished() && snapshot.archived_at.is_none() {
                    let mut archived = (*snapshot).clone();
                    archived.archived_at = Some(Utc::now());
                    archived.touch();
                    slot.publish(Arc::new(archived));
                }
                match self.evict(&id, &slot).await {
                    Ok(true) => report.evicted_by_age.push(id),
                    Ok(false) => {}
                    Err(e) => report.failed.push((id, e.to_string())),
                }
            } else {
                survivors.push((id, slot));
            }
        }

        survivors.sort_by_key(|(_, slot)| slot.last_access());
        for (id, slot) in survivors {
            if self.slots.len() <= max_active {
                break;
            }
            match self.evict(&id, &slot).await {
                Ok(true) => report.evicted_by_capacity.push(id),
                Ok(false) => {}
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }

        report.remaining = self.slots.len();
        info!(
            evicted = report.evicted(),
            failed = report.failed.len(),
            remaining = report.remaining,
            "Cleanup finished"
        );
        report
    }

    async fn evict(&self, id: &SessionId, slot: &Arc<Slot>) -> Result<bool> {
        let persisted = self.persist(slot).await?;
        // A lease may have come and gone while persisting; keep anything newer
        let removed = self.slots.remove_if(id, |_, current| {
            Arc::ptr_eq(current, slot)
                && !current.is_leased()
                && current.snapshot().revision == persisted
        });
        if removed.is_some() {
            debug!(session_id = %id, "Session evicted from memory");
        }
        Ok(removed.is_some())
    }

    pub async fn export(&self, id: &SessionId) -> Result<SessionSnapshot> {
        let session = self.get(id).await?;
        Ok(SessionSnapshot::new((*session).clone()))
    }

    /// Register and persist an exported session. Ids already known in
    /// memory or in the store are rejected.
    pub async fn import(&self, snapshot: SessionSnapshot) -> Result<SessionId> {
        let session = snapshot.session;
        let id = session.id.clone();
        if self.slots.contains_key(&id) || self.store.load(&id).await?.is_some() {
            return Err(QaflowError::SessionConflict(id.to_string()));
        }

        let slot = match self.slots.entry(id.clone()) {
            Entry::Occupied(_) => return Err(QaflowError::SessionConflict(id.to_string())),
            Entry::Vacant(vacant) => vacant.insert(Slot::new(session)).value().clone(),
        };

        if let Err(e) = self.persist(&slot).await {
            self.slots.remove(&id);
            return Err(e);
        }
        info!(session_id = %id, "Session imported");
        Ok(id)
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        let mut stats = RegistryStats {
            stored: self.store.count().await?,
            ..RegistryStats::default()
        };
        for entry in self.slots.iter() {
            let slot = entry.value();
            stats.in_memory += 1;
            if slot.is_leased() {
                stats.leased += 1;
            }
            *stats
                .by_status
                .entry(slot.snapshot().status.to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }
}
