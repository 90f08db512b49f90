//! Cluster provisioning through the kind CLI
//!
//! - [`Provisioner`]: the three-operation surface required from the external
//!   tool (create, delete, list), implemented for real by [`KindProvisioner`].
//! - [`ClusterProcessController`]: timeouts, status transitions and failure
//!   cleanup on top of a provisioner.
//! - [`ClusterHandle`]: one cluster and its lifecycle status.

pub mod args;
pub mod controller;
pub mod provisioner;

pub use controller::{leaves_partial_cluster, ClusterProcessController};
pub use provisioner::{KindProvisioner, Provisioner};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::state::StateRecord;
use crate::streaming::LogTail;

/// Creation failures; the only errors surfaced to test code
#[derive(Error, Debug, Clone)]
pub enum ProvisioningError {
    #[error("{tool} is not available: {message}")]
    ToolUnavailable { tool: String, message: String },

    #[error("Cluster '{0}' already exists")]
    AlreadyExists(String),

    #[error("Failed to create cluster '{name}': {message}")]
    Failed {
        name: String,
        message: String,
        log_tail: Vec<String>,
    },

    #[error("Cluster '{name}' was not ready within {}s", .timeout.as_secs())]
    Timeout {
        name: String,
        timeout: Duration,
        log_tail: Vec<String>,
    },

    #[error("Failed to export kubeconfig for '{name}': {message}")]
    Kubeconfig { name: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to record cluster '{name}': {message}")]
    Persist { name: String, message: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl ProvisioningError {
    /// Captured provisioning output, if any
    pub fn log_tail(&self) -> &[String] {
        match self {
            ProvisioningError::Failed { log_tail, .. }
            | ProvisioningError::Timeout { log_tail, .. } => log_tail,
            _ => &[],
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProvisioningError::Timeout { .. })
    }
}

impl From<std::io::Error> for ProvisioningError {
    fn from(e: std::io::Error) -> Self {
        ProvisioningError::Io(e.to_string())
    }
}

/// Failure running a provisioning tool command
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("Failed to run {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{command} timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
}

/// Deletion failures; logged, never surfaced to test code
#[derive(Error, Debug, Clone)]
pub enum TeardownError {
    #[error("Failed to delete cluster '{name}': {source}")]
    Tool {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("Deleting cluster '{name}' timed out after {}s", .timeout.as_secs())]
    Timeout { name: String, timeout: Duration },
}

/// Lifecycle status of a cluster handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Provisioning,
    Ready,
    Failed,
    Terminating,
    Terminated,
}

impl ClusterStatus {
    /// Allowed forward transitions; nothing re-enters `Provisioning`
    pub fn can_transition_to(self, next: ClusterStatus) -> bool {
        use ClusterStatus::*;
        matches!(
            (self, next),
            (Provisioning, Ready)
                | (Provisioning, Failed)
                | (Ready, Terminating)
                | (Terminating, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ClusterStatus::Failed | ClusterStatus::Terminated)
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Provisioning => "Provisioning",
            ClusterStatus::Ready => "Ready",
            ClusterStatus::Failed => "Failed",
            ClusterStatus::Terminating => "Terminating",
            ClusterStatus::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid status transition {from} -> {to}")]
pub struct StatusError {
    pub from: ClusterStatus,
    pub to: ClusterStatus,
}

/// A cluster managed by this process
///
/// Owned by the registry entry that created it; callers get shared
/// references and never delete it themselves.
pub struct ClusterHandle {
    id: Uuid,
    name: String,
    config: ClusterConfig,
    created_at: DateTime<Utc>,
    kubeconfig_path: OnceLock<PathBuf>,
    /// pid of the provisioning process while it runs
    process: Mutex<Option<u32>>,
    log_tail: Mutex<Option<LogTail>>,
    status: watch::Sender<ClusterStatus>,
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("kubeconfig_path", &self.kubeconfig_path())
            .finish()
    }
}

impl ClusterHandle {
    /// New handle in `Provisioning`
    pub fn new(name: impl Into<String>, config: ClusterConfig) -> Self {
        let (status, _) = watch::channel(ClusterStatus::Provisioning);
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            config,
            created_at: Utc::now(),
            kubeconfig_path: OnceLock::new(),
            process: Mutex::new(None),
            log_tail: Mutex::new(None),
            status,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn keep(&self) -> bool {
        self.config.keep
    }

    /// kubeconfig context for this cluster
    pub fn context_name(&self) -> String {
        args::context_name(&self.name)
    }

    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig_path.get().map(PathBuf::as_path)
    }

    pub(crate) fn set_kubeconfig_path(&self, path: PathBuf) {
        let _ = self.kubeconfig_path.set(path);
    }

    /// pid of the provisioning process, while one is running
    pub fn process_id(&self) -> Option<u32> {
        self.process.lock().ok().and_then(|p| *p)
    }

    pub fn set_process_id(&self, pid: Option<u32>) {
        if let Ok(mut process) = self.process.lock() {
            *process = pid;
        }
    }

    /// Make the provisioning output tail available for error reports
    pub fn attach_log_tail(&self, tail: LogTail) {
        if let Ok(mut slot) = self.log_tail.lock() {
            *slot = Some(tail);
        }
    }

    pub fn log_tail(&self) -> Vec<String> {
        self.log_tail
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(LogTail::lines))
            .unwrap_or_default()
    }

    pub fn status(&self) -> ClusterStatus {
        *self.status.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ClusterStatus::Ready
    }

    /// Move to `next`, returning the previous status
    pub fn transition(&self, next: ClusterStatus) -> Result<ClusterStatus, StatusError> {
        let mut result = Err(StatusError {
            from: next,
            to: next,
        });
        self.status.send_if_modified(|current| {
            if current.can_transition_to(next) {
                result = Ok(*current);
                *current = next;
                true
            } else {
                result = Err(StatusError {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        result
    }

    /// Wait until the handle has left `Provisioning`
    pub async fn wait_settled(&self) -> ClusterStatus {
        let mut rx = self.status.subscribe();
        let settled = match rx.wait_for(|s| *s != ClusterStatus::Provisioning).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        settled
    }

    /// Persisted projection of this handle
    pub fn to_record(&self, pid: u32, host: Option<String>) -> StateRecord {
        StateRecord {
            id: self.id,
            name: self.name.clone(),
            kubeconfig_path: self.kubeconfig_path().map(Path::to_path_buf),
            pid,
            created_at: self.created_at,
            scope: self.config.scope,
            keep: self.config.keep,
            host,
            owner: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_status_transitions() {
        use ClusterStatus::*;
        assert!(Provisioning.can_transition_to(Ready));
        assert!(Provisioning.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));

        assert!(!Ready.can_transition_to(Provisioning));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Terminated.can_transition_to(Provisioning));
        assert!(!Ready.can_transition_to(Terminated));
    }

    #[test]
    fn test_handle_transition() {
        let handle = ClusterHandle::new("kindtest-a", ClusterConfig::default());
        assert_eq!(handle.status(), ClusterStatus::Provisioning);

        assert_eq!(
            handle.transition(ClusterStatus::Ready),
            Ok(ClusterStatus::Provisioning)
        );
        let err = handle.transition(ClusterStatus::Provisioning).unwrap_err();
        assert_eq!(err.from, ClusterStatus::Ready);
        assert_eq!(handle.status(), ClusterStatus::Ready);
    }

    #[test]
    fn test_to_record() {
        let handle = ClusterHandle::new("kindtest-a", ClusterConfig::default());
        handle.set_kubeconfig_path(PathBuf::from("/tmp/kc"));
        let record = handle.to_record(99, Some("host".to_string()));

        assert_eq!(record.id, handle.id());
        assert_eq!(record.name, "kindtest-a");
        assert_eq!(record.kubeconfig_path, Some(PathBuf::from("/tmp/kc")));
        assert_eq!(record.pid, 99);
        assert_eq!(handle.context_name(), "kind-kindtest-a");
    }

    #[tokio::test]
    async fn test_wait_settled() {
        let handle = Arc::new(ClusterHandle::new("kindtest-a", ClusterConfig::default()));
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_settled().await })
        };

        tokio::task::yield_now().await;
        handle.transition(ClusterStatus::Failed).unwrap();

        assert_eq!(waiter.await.unwrap(), ClusterStatus::Failed);
    }

    #[test]
    fn test_provisioning_error_tail() {
        let err = ProvisioningError::Timeout {
            name: "c".to_string(),
            timeout: Duration::from_secs(1),
            log_tail: vec!["Creating cluster".to_string()],
        };
        assert!(err.is_timeout());
        assert_eq!(err.log_tail(), ["Creating cluster".to_string()]);
        assert_eq!(err.to_string(), "Cluster 'c' was not ready within 1s");
    }
}
