mod common;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};

use qaflow_core::config::RegistryConfig;
use qaflow_core::error::QaflowError;
use qaflow_core::traits::SessionStore;
use qaflow_core::types::{Session, SessionId, SessionSnapshot, SessionStatus};
use qaflow_engine::SessionRegistry;
use qaflow_store::SqliteSessionStore;

#[tokio::test]
async fn ten_thousand_creates_yield_distinct_ids() {
    let registry = common::registry(common::FlakyStore::new());
    let ids: HashSet<_> = (0..10_000)
        .map(|i| registry.create(&format!("run-{}", i), None))
        .collect();
    assert_eq!(ids.len(), 10_000);
    assert_eq!(registry.len(), 10_000);
}

#[tokio::test]
async fn concurrent_activation_grants_one_lease() {
    let registry = common::registry(common::FlakyStore::new());
    let id = registry.create("contended", None);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            registry.activate(&id).await.map(|(lease, _)| lease)
        }));
    }

    let mut leases = Vec::new();
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(lease) => leases.push(lease),
            Err(QaflowError::SessionConflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(leases.len(), 1);
    assert_eq!(conflicts, 15);
}

#[tokio::test]
async fn conflicting_activation_leaves_snapshot_unchanged() {
    let registry = common::registry(common::FlakyStore::new());
    let id = registry.create("t", None);
    let (_lease, _) = registry.activate(&id).await.unwrap();
    let before = registry.get(&id).await.unwrap();

    assert!(matches!(
        registry.activate(&id).await,
        Err(QaflowError::SessionConflict(_))
    ));
    let after = registry.get(&id).await.unwrap();
    assert_eq!(*after, *before);
    assert_eq!(after.revision, before.revision);
}

#[tokio::test]
async fn sessions_survive_restart_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sessions.db");
    let results = dir.path().join("results");

    let id = {
        let store = Arc::new(SqliteSessionStore::open(&db).unwrap());
        let registry = SessionRegistry::new(store, RegistryConfig::default(), results.clone());
        let id = registry.create("durable", Some("ops".into()));
        let (lease, session) = registry.activate(&id).await.unwrap();
        registry.deactivate(lease, session, SessionStatus::Paused).await.unwrap();
        id
    };

    let store = Arc::new(SqliteSessionStore::open(&db).unwrap());
    let registry = SessionRegistry::new(store, RegistryConfig::default(), results);
    assert!(!registry.contains(&id));
    let session = registry.get(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Paused);
    assert_eq!(session.owner.as_deref(), Some("ops"));
    assert!(registry.activate(&id).await.is_ok());
}

#[tokio::test]
async fn export_import_between_workspaces() {
    let source = common::registry(common::FlakyStore::new());
    let id = source.create("portable", None);
    let (lease, mut session) = source.activate(&id).await.unwrap();
    session.record_success("login", serde_json::json!({"user": "qa-bot"}));
    source.deactivate(lease, session, SessionStatus::Completed).await.unwrap();

    let json = source.export(&id).await.unwrap().to_json().unwrap();

    let target_store = common::FlakyStore::new();
    let target = common::registry(target_store.clone());
    let imported = target.import(SessionSnapshot::from_json(&json).unwrap()).await.unwrap();
    assert_eq!(imported, id);
    assert_eq!(target_store.load(&id).await.unwrap().unwrap().executed_nodes, vec!["login"]);

    let again = target.import(SessionSnapshot::from_json(&json).unwrap()).await;
    assert!(matches!(again, Err(QaflowError::SessionConflict(_))));
}

fn month_old(id: &str, status: SessionStatus) -> SessionSnapshot {
    let dir = PathBuf::from("/tmp/qaflow-it").join(id);
    let mut session = Session::new(SessionId::from(id), id, dir);
    session.status = status;
    session.created_at = Utc::now() - Duration::days(30);
    SessionSnapshot::new(session)
}

#[tokio::test]
async fn cleanup_by_age_archives_finished_and_keeps_paused_resumable() {
    let store = common::FlakyStore::new();
    let registry = common::registry(store.clone());
    let done = registry.import(month_old("old-done", SessionStatus::Completed)).await.unwrap();
    let paused = registry.import(month_old("old-paused", SessionStatus::Paused)).await.unwrap();
    let fresh = registry.create("fresh", None);

    let report = registry.cleanup(100, 7).await;
    assert_eq!(report.evicted_by_age.len(), 2);
    assert!(report.evicted_by_age.contains(&done));
    assert!(report.evicted_by_age.contains(&paused));
    assert!(report.evicted_by_capacity.is_empty());
    assert!(report.failed.is_empty());
    assert!(registry.contains(&fresh));
    assert!(!registry.contains(&done));

    let stored_done = store.load(&done).await.unwrap().unwrap();
    assert_eq!(stored_done.status, SessionStatus::Completed);
    assert!(stored_done.archived_at.is_some());

    let stored_paused = store.load(&paused).await.unwrap().unwrap();
    assert_eq!(stored_paused.status, SessionStatus::Paused);
    assert!(stored_paused.archived_at.is_none());

    let (_lease, working) = registry.activate(&paused).await.unwrap();
    assert_eq!(working.status, SessionStatus::Active);
}

#[tokio::test]
async fn zero_days_disables_the_age_pass() {
    let registry = common::registry(common::FlakyStore::new());
    let old = registry.import(month_old("old-created", SessionStatus::Created)).await.unwrap();

    let report = registry.cleanup(100, 0).await;
    assert_eq!(report.evicted(), 0);
    assert!(registry.contains(&old));
}
