//! Cluster process controller
//!
//! Wraps a [`Provisioner`] with the lifecycle rules: creation and deletion
//! timeouts, status transitions, and a best-effort cleanup of half-created
//! clusters.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::args::generate_cluster_name;
use super::provisioner::Provisioner;
use super::{ClusterHandle, ClusterStatus, ProvisioningError, TeardownError, ToolError};
use crate::config::ClusterConfig;

/// Upper bound for the cleanup attempt after a failed creation
const FAILED_CREATE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates, deletes and probes clusters through a provisioner
#[derive(Clone)]
pub struct ClusterProcessController {
    provisioner: Arc<dyn Provisioner>,
}

impl std::fmt::Debug for ClusterProcessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterProcessController").finish_non_exhaustive()
    }
}

impl ClusterProcessController {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self { provisioner }
    }

    /// Allocate a handle in `Provisioning` for the given configuration
    pub fn begin(&self, config: &ClusterConfig) -> Arc<ClusterHandle> {
        let name = config.name.clone().unwrap_or_else(generate_cluster_name);
        Arc::new(ClusterHandle::new(name, config.clone()))
    }

    /// Run the provisioning tool for a handle, bounded by `limit`
    ///
    /// On success the handle has its kubeconfig path but is still in
    /// `Provisioning`; the caller decides when it becomes `Ready`. On failure
    /// the handle is `Failed` and cleaning up whatever the tool left behind
    /// is up to the caller (see [`leaves_partial_cluster`]).
    pub async fn provision(
        &self,
        handle: &ClusterHandle,
        limit: Duration,
    ) -> Result<(), ProvisioningError> {
        let result = match timeout(limit, self.provisioner.create_cluster(handle)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Creating cluster '{}' exceeded {}s, abandoning",
                    handle.name(),
                    limit.as_secs()
                );
                Err(ProvisioningError::Timeout {
                    name: handle.name().to_string(),
                    timeout: limit,
                    log_tail: handle.log_tail(),
                })
            }
        };
        handle.set_process_id(None);

        match result {
            Ok(kubeconfig) => {
                handle.set_kubeconfig_path(kubeconfig);
                Ok(())
            }
            Err(e) => {
                let _ = handle.transition(ClusterStatus::Failed);
                Err(e)
            }
        }
    }

    /// Create a cluster and wait until it is `Ready`
    ///
    /// A failed creation makes one bounded deletion attempt before the
    /// error is returned.
    pub async fn create(
        &self,
        config: &ClusterConfig,
        limit: Duration,
    ) -> Result<Arc<ClusterHandle>, ProvisioningError> {
        let handle = self.begin(config);
        if let Err(e) = self.provision(&handle, limit).await {
            if leaves_partial_cluster(&e) {
                self.cleanup_failed(handle.name()).await;
            }
            return Err(e);
        }
        handle
            .transition(ClusterStatus::Ready)
            .map_err(|e| ProvisioningError::Config(e.to_string()))?;
        Ok(handle)
    }

    /// Delete the cluster behind a handle
    ///
    /// Moves the handle through `Terminating` to `Terminated`. A cluster that
    /// is already gone counts as deleted.
    pub async fn delete(&self, handle: &ClusterHandle, limit: Duration) -> Result<(), TeardownError> {
        if let Err(e) = handle.transition(ClusterStatus::Terminating) {
            debug!("Deleting '{}' from status {}", handle.name(), e.from);
        }

        let result = self
            .delete_named(handle.name(), handle.kubeconfig_path(), limit)
            .await;

        let _ = handle.transition(ClusterStatus::Terminated);
        result
    }

    /// Delete a cluster by name, removing its kubeconfig file on success
    pub async fn delete_named(
        &self,
        name: &str,
        kubeconfig: Option<&Path>,
        limit: Duration,
    ) -> Result<(), TeardownError> {
        match timeout(limit, self.provisioner.delete_cluster(name)).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                return Err(TeardownError::Tool {
                    name: name.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(TeardownError::Timeout {
                    name: name.to_string(),
                    timeout: limit,
                })
            }
        }

        if let Some(path) = kubeconfig {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!("Removed kubeconfig {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!("Could not remove kubeconfig {}: {}", path.display(), e),
            }
        }

        Ok(())
    }

    /// Whether a cluster with this name currently exists
    ///
    /// Only meant for orphan recovery. A failing listing counts as unreachable.
    pub async fn is_reachable(&self, name: &str) -> bool {
        match self.live_clusters().await {
            Ok(clusters) => clusters.iter().any(|c| c == name),
            Err(e) => {
                warn!("Could not list clusters while probing '{}': {}", name, e);
                false
            }
        }
    }

    /// Names of all currently live clusters
    pub async fn live_clusters(&self) -> Result<Vec<String>, ToolError> {
        self.provisioner.list_clusters().await
    }

    async fn cleanup_failed(&self, name: &str) {
        info!("Cleaning up after failed creation of '{}'", name);
        if let Err(e) = self
            .delete_named(name, None, FAILED_CREATE_CLEANUP_TIMEOUT)
            .await
        {
            warn!("Cleanup of failed cluster '{}' did not complete: {}", name, e);
        }
    }
}

/// Whether a creation failure may have left containers behind
pub fn leaves_partial_cluster(err: &ProvisioningError) -> bool {
    !matches!(
        err,
        ProvisioningError::ToolUnavailable { .. }
            | ProvisioningError::AlreadyExists(_)
            | ProvisioningError::Config(_)
    )
}
