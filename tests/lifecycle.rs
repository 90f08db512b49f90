//! End-to-end cluster lifecycle against a stub provisioner
//!
//! Covers sharing by scope key, exactly-once teardown under racing
//! triggers, crash recovery through the orphan sweep and creation timeouts.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use common::{dead_pid, test_settings, StubProvisioner};
use kindtest::cleanup::TeardownOutcome;
use kindtest::config::{ClusterConfig, ClusterOverrides, Scope, TestUnit};
use kindtest::kind::{ClusterProcessController, ClusterStatus, ProvisioningError};
use kindtest::registry::ReleaseOutcome;
use kindtest::state::{current_host, StateRecord, StateStore};
use kindtest::Session;

fn unit() -> TestUnit {
    TestUnit::new("run-1")
        .with_module("tests/test_pods")
        .with_function("test_create_pod")
}

fn orphan(name: &str) -> StateRecord {
    StateRecord {
        id: Uuid::new_v4(),
        name: name.to_string(),
        kubeconfig_path: None,
        pid: dead_pid(),
        created_at: Utc::now(),
        scope: Scope::Session,
        keep: false,
        host: Some(current_host()),
        owner: None,
    }
}

#[tokio::test]
async fn test_same_key_returns_same_handle() {
    let dir = TempDir::new().unwrap();
    let stub = StubProvisioner::new();
    let session = Session::with_provisioner(test_settings(&dir), stub.clone()).await;

    let first = session.acquire(&unit(), &ClusterOverrides::default()).await.unwrap();
    let second = session.acquire(&unit(), &ClusterOverrides::default()).await.unwrap();

    assert!(Arc::ptr_eq(first.handle(), second.handle()));
    assert_eq!(first.key(), second.key());
    assert_eq!(session.registry().refcount(first.key()).await, Some(2));
    assert_eq!(stub.creates(), 1);

    assert_eq!(
        session.release(second).await.unwrap(),
        ReleaseOutcome::Retained { refcount: 1 }
    );
    assert_eq!(stub.deletes(), 0);
    assert_eq!(
        session.release(first).await.unwrap(),
        ReleaseOutcome::TornDown(TeardownOutcome::Deleted)
    );
    assert_eq!(stub.deletes(), 1);
    assert!(session.store().load().is_empty());

    session.finish().await;
    assert_eq!(stub.deletes(), 1);
}

#[tokio::test]
async fn test_distinct_keys_never_share() {
    let dir = TempDir::new().unwrap();
    let stub = StubProvisioner::new();
    let session = Session::with_provisioner(test_settings(&dir), stub.clone()).await;

    let overrides = [
        ClusterOverrides::default(),
        ClusterOverrides::new().with_scope(Scope::Module),
        ClusterOverrides::new().with_scope(Scope::Function),
        ClusterOverrides::new().with_image("kindest/node:v1.29.2"),
        ClusterOverrides::new().with_workers(2),
    ];

    let mut leases = Vec::new();
    for o in &overrides {
        leases.push(session.acquire(&unit(), o).await.unwrap());
    }

    for (i, a) in leases.iter().enumerate() {
        for b in &leases[i + 1..] {
            assert_ne!(a.key(), b.key());
            assert_ne!(a.handle().id(), b.handle().id());
        }
    }
    assert_eq!(stub.creates(), overrides.len());

    let summary = session.finish().await;
    assert_eq!(summary.teardowns, overrides.len());
    assert!(stub.live().is_empty());
}

#[tokio::test]
async fn test_session_and_function_scope_scenario() {
    let dir = TempDir::new().unwrap();
    let stub = StubProvisioner::new();
    let session = Session::with_provisioner(test_settings(&dir), stub.clone()).await;
    let session_scoped = ClusterOverrides::new()
        .with_scope(Scope::Session)
        .with_timeout(300);

    let a = session.acquire(&unit(), &session_scoped).await.unwrap();
    let b = session.acquire(&unit(), &session_scoped).await.unwrap();
    assert_eq!(a.handle().id(), b.handle().id());
    assert_eq!(stub.creates(), 1);

    let function_scoped = ClusterOverrides::new()
        .with_scope(Scope::Function)
        .with_image("kindest/node:v1.30.0");
    let c = session.acquire(&unit(), &function_scoped).await.unwrap();

    assert_ne!(c.handle().id(), a.handle().id());
    assert_ne!(c.name(), a.name());
    assert_eq!(stub.creates(), 2);
    assert_eq!(session.store().load().len(), 2);

    session.finish().await;
}

#[tokio::test]
async fn test_release_and_interrupt_race_deletes_once() {
    for release_first in [true, false] {
        let dir = TempDir::new().unwrap();
        let stub = StubProvisioner::new().with_delete_delay(Duration::from_millis(50));
        let session = Session::with_provisioner(test_settings(&dir), stub.clone()).await;
        let coordinator = session.coordinator().clone();

        let lease = session.acquire(&unit(), &ClusterOverrides::default()).await.unwrap();
        let id = lease.handle().id();

        let release = session.release(lease);
        let interrupt = async {
            coordinator.request_all();
            coordinator.drain().await;
        };
        if release_first {
            let (released, _) = tokio::join!(release, interrupt);
            released.unwrap();
        } else {
            let (_, released) = tokio::join!(interrupt, release);
            released.unwrap();
        }
        coordinator.drain().await;

        assert_eq!(stub.deletes(), 1, "release_first={}", release_first);
        assert_eq!(
            coordinator.state(id),
            Some(kindtest::cleanup::TeardownState::Torn)
        );
        assert!(session.store().load().is_empty());

        session.finish().await;
        assert_eq!(stub.deletes(), 1);
    }
}

#[tokio::test]
async fn test_interrupt_during_creation_still_tears_down() {
    let dir = TempDir::new().unwrap();
    let stub = StubProvisioner::new().with_create_delay(Duration::from_millis(200));
    let session = Arc::new(Session::with_provisioner(test_settings(&dir), stub.clone()).await);
    let coordinator = session.coordinator().clone();

    let acquiring = {
        let session = session.clone();
        tokio::spawn(async move { session.acquire(&unit(), &ClusterOverrides::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(coordinator.request_all(), 1);
    coordinator.drain().await;

    let lease = acquiring.await.unwrap().unwrap();
    assert_eq!(lease.handle().status(), ClusterStatus::Terminated);
    assert_eq!(stub.deletes(), 1);
    assert!(stub.live().is_empty());
    assert!(session.store().load().is_empty());
}

#[tokio::test]
async fn test_crashed_session_is_swept_by_next_session() {
    let dir = TempDir::new().unwrap();
    let stub = StubProvisioner::new();

    let crashed = Session::with_provisioner(test_settings(&dir), stub.clone()).await;
    let lease = crashed.acquire(&unit(), &ClusterOverrides::default()).await.unwrap();
    let name = lease.name().to_string();
    // killed without running any cleanup
    std::mem::forget(crashed);
    assert_eq!(stub.live(), vec![name.clone()]);

    // as the dead run left it: owned by a process that no longer exists
    let store = StateStore::new(test_settings(&dir).state_file_path());
    let mut record = store.load().remove(0);
    record.pid = dead_pid();
    record.owner = None;
    store.upsert(record).unwrap();

    let next = Session::with_provisioner(test_settings(&dir), stub.clone()).await;

    assert_eq!(next.orphan_report().deleted, vec![name]);
    assert_eq!(stub.deletes(), 1);
    assert!(stub.live().is_empty());
    assert!(next.store().load().is_empty());
    next.finish().await;
}

#[tokio::test]
async fn test_sweep_removes_stale_record_without_deleting() {
    let dir = TempDir::new().unwrap();
    let stub = StubProvisioner::new();
    let store = StateStore::new(test_settings(&dir).state_file_path());
    store.upsert(orphan("kindtest-deadbeef")).unwrap();

    let session = Session::with_provisioner(test_settings(&dir), stub.clone()).await;

    assert_eq!(session.orphan_report().stale_removed, vec!["kindtest-deadbeef"]);
    assert_eq!(stub.deletes(), 0);
    assert!(store.load().is_empty());
    session.finish().await;
}

#[tokio::test]
async fn test_orphan_sweep_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let stub = StubProvisioner::new();
    let store = StateStore::new(test_settings(&dir).state_file_path());
    store.upsert(orphan("kindtest-0badf00d")).unwrap();
    stub.add_live("kindtest-0badf00d");

    let mut settings = test_settings(&dir);
    settings.cleanup_orphaned = false;
    let session = Session::with_provisioner(settings, stub.clone()).await;

    assert_eq!(stub.deletes(), 0);
    assert_eq!(store.load().len(), 1);
    session.finish().await;
}

#[tokio::test]
async fn test_delete_of_absent_cluster_succeeds() {
    let controller = ClusterProcessController::new(StubProvisioner::new());
    let result = controller
        .delete_named("kindtest-gone", None, Duration::from_secs(5))
        .await;
    assert!(result.is_ok());
    assert!(!controller.is_reachable("kindtest-gone").await);
}

#[tokio::test]
async fn test_cancelled_acquire_does_not_block_finish() {
    let dir = TempDir::new().unwrap();
    let stub = StubProvisioner::new().with_create_delay(Duration::from_secs(5));
    let session = Session::with_provisioner(test_settings(&dir), stub.clone()).await;
    let store = session.store().clone();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(100),
        session.acquire(&unit(), &ClusterOverrides::default()),
    )
    .await;
    assert!(cancelled.is_err());

    let summary = tokio::time::timeout(Duration::from_secs(8), session.finish())
        .await
        .expect("finish did not complete");

    assert_eq!(summary.teardowns, 0);
    // the partly created cluster is deleted by name
    assert_eq!(stub.deletes(), 1);
    assert!(stub.live().is_empty());
    assert!(store.load().is_empty());
}

#[tokio::test]
async fn test_creation_timeout_is_bounded_and_unrecorded() {
    let dir = TempDir::new().unwrap();
    // cleanup of the half-created cluster is slow and must not hold up the error
    let stub = StubProvisioner::never_ready().with_delete_delay(Duration::from_secs(3));
    let session = Session::with_provisioner(test_settings(&dir), stub.clone()).await;

    let started = Instant::now();
    let err = session
        .acquire(&unit(), &ClusterOverrides::new().with_timeout(1))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    let err = err.as_provisioning().expect("provisioning error");
    assert!(err.is_timeout(), "unexpected error: {}", err);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert!(session.store().load().is_empty());
    assert!(session.registry().is_empty().await);

    let summary = session.finish().await;
    assert_eq!(summary.teardowns, 0);
    assert_eq!(stub.deletes(), 1);
}

#[tokio::test]
async fn test_timed_out_handle_is_failed() {
    let controller = ClusterProcessController::new(StubProvisioner::never_ready());
    let config = ClusterConfig {
        timeout_secs: 1,
        ..Default::default()
    };
    let handle = controller.begin(&config);

    let err = controller
        .provision(&handle, Duration::from_secs(config.timeout_secs))
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::Timeout { .. }));
    assert_eq!(handle.status(), ClusterStatus::Failed);
    assert!(handle.process_id().is_none());
}

#[tokio::test]
async fn test_corrupt_state_line_is_skipped() {
    let dir = TempDir::new().unwrap();
    let path = test_settings(&dir).state_file_path();
    let good = orphan("kindtest-good");
    let content = format!(
        "{}\n{{\"id\":\"not-a-uuid\",\"name\":\"kindtest-tr",
        serde_json::to_string(&good).unwrap()
    );
    std::fs::write(&path, content).unwrap();

    let store = StateStore::new(&path);
    assert_eq!(store.load(), vec![good.clone()]);

    // a session starting over the same file sweeps the readable record
    let stub = StubProvisioner::new();
    stub.add_live("kindtest-good");
    let session = Session::with_provisioner(test_settings(&dir), stub.clone()).await;
    assert_eq!(session.orphan_report().deleted, vec!["kindtest-good"]);
    session.finish().await;
}

#[tokio::test]
async fn test_two_sessions_share_state_file() {
    let dir = TempDir::new().unwrap();
    let stub = StubProvisioner::new();

    let a = Session::with_provisioner(test_settings(&dir), stub.clone()).await;
    let held = a.acquire(&unit(), &ClusterOverrides::default()).await.unwrap();

    // b's startup sweep leaves a's live cluster alone
    let b = Session::with_provisioner(test_settings(&dir), stub.clone()).await;
    assert!(b.orphan_report().deleted.is_empty());
    assert!(b.orphan_report().stale_removed.is_empty());
    assert_eq!(b.orphan_report().skipped, 1);
    assert_eq!(stub.live(), vec![held.name().to_string()]);
    assert_eq!(stub.deletes(), 0);

    let (unit_b, unit_c) = (TestUnit::new("run-2"), TestUnit::new("run-3"));
    let overrides = ClusterOverrides::default();
    let (lb, lc) = tokio::join!(b.acquire(&unit_b, &overrides), a.acquire(&unit_c, &overrides));
    let (lb, lc) = (lb.unwrap(), lc.unwrap());
    assert_ne!(lb.name(), lc.name());
    assert_eq!(a.store().load().len(), 3);

    a.finish().await;
    let remaining = b.store().load();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, lb.name());
    assert_eq!(stub.live(), vec![lb.name().to_string()]);
    b.finish().await;
    assert!(stub.live().is_empty());
}
