//! Test-session context
//!
//! A [`Session`] owns the registry, the cleanup coordinator and the state
//! store for one test run. Test code acquires clusters through it and hands
//! the lease back when done; [`Session::finish`] is the normal exit hook.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cleanup::{CleanupCoordinator, OrphanCleanupFailure, SweepReport};
use crate::config::{
    resolve, ClusterConfig, ClusterOverrides, ConfigError, ScopeKey, Settings, TestUnit,
};
use crate::kind::{
    ClusterHandle, ClusterProcessController, KindProvisioner, Provisioner, ProvisioningError,
};
use crate::registry::{ClusterRegistry, RegistryError, ReleaseOutcome};
use crate::state::StateStore;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid cluster configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl SessionError {
    /// The creation failure, if this is one
    pub fn as_provisioning(&self) -> Option<&ProvisioningError> {
        match self {
            SessionError::Provisioning(e) => Some(e),
            _ => None,
        }
    }
}

/// A held cluster; give it back with [`Session::release`]
#[derive(Debug, Clone)]
pub struct ClusterLease {
    key: ScopeKey,
    handle: Arc<ClusterHandle>,
}

impl ClusterLease {
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    pub fn handle(&self) -> &Arc<ClusterHandle> {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.handle.kubeconfig_path()
    }

    pub fn context_name(&self) -> String {
        self.handle.context_name()
    }
}

/// What happened during a session's cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub teardowns: usize,
    pub teardown_failures: usize,
    pub orphans_deleted: usize,
    pub stale_records_removed: usize,
    pub orphan_failures: Vec<OrphanCleanupFailure>,
}

/// One test run's cluster context
pub struct Session {
    settings: Settings,
    store: Arc<StateStore>,
    controller: ClusterProcessController,
    coordinator: Arc<CleanupCoordinator>,
    registry: ClusterRegistry,
    defaults: ClusterConfig,
    global: ClusterOverrides,
    orphan_report: SweepReport,
    interrupt_task: Option<JoinHandle<()>>,
    finished: bool,
}

impl Session {
    /// Start a session backed by the kind CLI
    pub async fn start(settings: Settings) -> Self {
        let provisioner = KindProvisioner::from_settings(&settings);
        Self::with_provisioner(settings, Arc::new(provisioner)).await
    }

    /// Start a session with a custom provisioner
    ///
    /// Runs the orphan sweep before anything is created and installs the
    /// interrupt handler, each when enabled in `settings`.
    pub async fn with_provisioner(settings: Settings, provisioner: Arc<dyn Provisioner>) -> Self {
        let store = Arc::new(StateStore::new(settings.state_file_path()));
        let controller = ClusterProcessController::new(provisioner);
        let coordinator = CleanupCoordinator::new(
            controller.clone(),
            store.clone(),
            Duration::from_secs(settings.teardown_timeout_secs),
        );
        let registry = ClusterRegistry::new(controller.clone(), coordinator.clone(), store.clone());

        let orphan_report = if settings.cleanup_orphaned {
            coordinator.sweep_orphans().await
        } else {
            SweepReport::default()
        };

        let interrupt_task = settings
            .cleanup_on_interrupt
            .then(|| coordinator.install_interrupt_handler());

        info!("Session started (state file {})", store.path().display());

        Self {
            global: settings.cluster_overrides(),
            settings,
            store,
            controller,
            coordinator,
            registry,
            defaults: ClusterConfig::default(),
            orphan_report,
            interrupt_task,
            finished: false,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<CleanupCoordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Result of the startup orphan sweep
    pub fn orphan_report(&self) -> &SweepReport {
        &self.orphan_report
    }

    /// Acquire a cluster for `unit` with per-call `overrides`
    pub async fn acquire(
        &self,
        unit: &TestUnit,
        overrides: &ClusterOverrides,
    ) -> Result<ClusterLease, SessionError> {
        let (key, config) = resolve(&self.defaults, &self.global, overrides, unit)?;
        let handle = self.registry.acquire(&key, &config).await?;
        Ok(ClusterLease { key, handle })
    }

    /// Give a lease back
    pub async fn release(&self, lease: ClusterLease) -> Result<ReleaseOutcome, SessionError> {
        Ok(self.registry.release(&lease.key).await?)
    }

    /// Whether the cluster behind a lease still exists
    pub async fn is_reachable(&self, lease: &ClusterLease) -> bool {
        self.controller.is_reachable(lease.name()).await
    }

    /// End the session: tear down everything still live and report
    pub async fn finish(mut self) -> SessionSummary {
        self.finished = true;
        if let Some(task) = self.interrupt_task.take() {
            task.abort();
        }

        self.coordinator.shutdown().await;

        let stats = self.coordinator.stats();
        let summary = SessionSummary {
            teardowns: stats.deleted,
            teardown_failures: stats.failed,
            orphans_deleted: self.orphan_report.deleted.len(),
            stale_records_removed: self.orphan_report.stale_removed.len(),
            orphan_failures: self.coordinator.orphan_failures(),
        };

        if !summary.orphan_failures.is_empty() {
            warn!(
                "{} orphaned cluster(s) could not be cleaned up:",
                summary.orphan_failures.len()
            );
            for failure in &summary.orphan_failures {
                warn!("  {}", failure);
            }
        }
        if summary.teardown_failures > 0 {
            warn!(
                "{} cluster teardown(s) failed; the next orphan sweep will retry",
                summary.teardown_failures
            );
        }
        info!(
            "Session finished: {} cluster(s) torn down",
            summary.teardowns
        );
        summary
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(task) = self.interrupt_task.take() {
            task.abort();
        }
        if self.coordinator.tracked() == 0 && self.coordinator.pending() == 0 {
            return;
        }
        warn!("Session dropped without finish(), tearing down its clusters");
        self.coordinator.shutdown_blocking();
    }
}

/// Emergency operator entry point: delete every cluster recorded in the
/// default state file
pub async fn emergency_cleanup() -> SweepReport {
    let settings = Settings::default();
    let provisioner = Arc::new(KindProvisioner::from_settings(&settings));
    emergency_cleanup_with(&settings, provisioner).await
}

/// Emergency cleanup with explicit settings and provisioner
pub async fn emergency_cleanup_with(
    settings: &Settings,
    provisioner: Arc<dyn Provisioner>,
) -> SweepReport {
    let store = Arc::new(StateStore::new(settings.state_file_path()));
    let coordinator = CleanupCoordinator::new(
        ClusterProcessController::new(provisioner),
        store,
        Duration::from_secs(settings.teardown_timeout_secs),
    );
    let report = coordinator.purge_recorded().await;
    info!(
        "Emergency cleanup: {} deleted, {} stale, {} failed",
        report.deleted.len(),
        report.stale_removed.len(),
        report.failures.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scope;
    use crate::kind::ToolError;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeKind {
        live: Mutex<Vec<String>>,
        creates: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl Provisioner for FakeKind {
        async fn create_cluster(
            &self,
            handle: &ClusterHandle,
        ) -> Result<PathBuf, ProvisioningError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.live.lock().unwrap().push(handle.name().to_string());
            Ok(PathBuf::from("/nonexistent/kc"))
        }

        async fn delete_cluster(&self, name: &str) -> Result<(), ToolError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.live.lock().unwrap().retain(|c| c != name);
            Ok(())
        }

        async fn list_clusters(&self) -> Result<Vec<String>, ToolError> {
            Ok(self.live.lock().unwrap().clone())
        }
    }

    fn settings(dir: &TempDir) -> Settings {
        Settings {
            state_file: Some(dir.path().join("clusters.jsonl")),
            cleanup_on_interrupt: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_finish_tears_down_held_clusters() {
        let dir = TempDir::new().unwrap();
        let kind = Arc::new(FakeKind::default());
        let session = Session::with_provisioner(settings(&dir), kind.clone()).await;
        let unit = TestUnit::new("s");

        let lease = session
            .acquire(&unit, &ClusterOverrides::default())
            .await
            .unwrap();
        assert_eq!(lease.key().scope, Scope::Session);
        assert_eq!(session.store().load().len(), 1);
        assert!(session.is_reachable(&lease).await);

        let summary = session.finish().await;
        assert_eq!(summary.teardowns, 1);
        assert_eq!(kind.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_override_is_config_error() {
        let dir = TempDir::new().unwrap();
        let session =
            Session::with_provisioner(settings(&dir), Arc::new(FakeKind::default())).await;

        let err = session
            .acquire(
                &TestUnit::new("s"),
                &ClusterOverrides::new().with_name("Not_Valid"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        session.finish().await;
    }

    #[tokio::test]
    async fn test_kept_cluster_survives_finish() {
        let dir = TempDir::new().unwrap();
        let kind = Arc::new(FakeKind::default());
        let mut settings = settings(&dir);
        settings.keep_clusters = true;
        let session = Session::with_provisioner(settings, kind.clone()).await;

        let lease = session
            .acquire(&TestUnit::new("s"), &ClusterOverrides::default())
            .await
            .unwrap();
        session.release(lease).await.unwrap();
        let summary = session.finish().await;

        assert_eq!(summary.teardowns, 0);
        assert_eq!(kind.deletes.load(Ordering::SeqCst), 0);
        assert_eq!(kind.live.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_without_finish_tears_down() {
        let dir = TempDir::new().unwrap();
        let kind = Arc::new(FakeKind::default());
        let session = Session::with_provisioner(settings(&dir), kind.clone()).await;
        let store = session.store().clone();
        session
            .acquire(&TestUnit::new("s"), &ClusterOverrides::default())
            .await
            .unwrap();

        drop(session);

        assert_eq!(kind.deletes.load(Ordering::SeqCst), 1);
        assert!(kind.live.lock().unwrap().is_empty());
        assert!(store.load().is_empty());
    }

    #[tokio::test]
    async fn test_drop_on_current_thread_runtime_tears_down() {
        let dir = TempDir::new().unwrap();
        let kind = Arc::new(FakeKind::default());
        let session = Session::with_provisioner(settings(&dir), kind.clone()).await;
        let store = session.store().clone();
        session
            .acquire(&TestUnit::new("s"), &ClusterOverrides::default())
            .await
            .unwrap();

        drop(session);

        assert_eq!(kind.deletes.load(Ordering::SeqCst), 1);
        assert!(store.load().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_cleanup_deletes_recorded() {
        let dir = TempDir::new().unwrap();
        let kind = Arc::new(FakeKind::default());
        let mut settings = settings(&dir);
        settings.keep_clusters = true;

        let session = Session::with_provisioner(settings.clone(), kind.clone()).await;
        session
            .acquire(&TestUnit::new("s"), &ClusterOverrides::default())
            .await
            .unwrap();
        session.finish().await;
        assert_eq!(kind.live.lock().unwrap().len(), 1);

        let report = emergency_cleanup_with(&settings, kind.clone()).await;
        assert_eq!(report.deleted.len(), 1);
        assert!(kind.live.lock().unwrap().is_empty());
        assert!(StateStore::new(settings.state_file_path()).load().is_empty());
    }
}
