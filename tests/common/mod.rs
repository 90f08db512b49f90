//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use kindtest::kind::{ClusterHandle, Provisioner, ProvisioningError, ToolError};
use kindtest::Settings;

/// Provisioner that pretends to run kind and counts every call
#[derive(Default)]
pub struct StubProvisioner {
    live: Mutex<Vec<String>>,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub lists: AtomicUsize,
    /// creation never reports ready
    pub never_ready: AtomicBool,
    pub create_delay: Mutex<Option<Duration>>,
    pub delete_delay: Mutex<Option<Duration>>,
}

impl StubProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn never_ready() -> Arc<Self> {
        let stub = Self::default();
        stub.never_ready.store(true, Ordering::SeqCst);
        Arc::new(stub)
    }

    pub fn with_create_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.create_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn with_delete_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delete_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Pretend a cluster exists, as if left by another process
    pub fn add_live(&self, name: &str) {
        self.live.lock().unwrap().push(name.to_string());
    }

    pub fn live(&self) -> Vec<String> {
        self.live.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for StubProvisioner {
    async fn create_cluster(&self, handle: &ClusterHandle) -> Result<PathBuf, ProvisioningError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.never_ready.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.live.lock().unwrap().push(handle.name().to_string());
        Ok(PathBuf::from(format!("/nonexistent/kubeconfig-{}", handle.name())))
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), ToolError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delete_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        // absent clusters delete fine
        self.live.lock().unwrap().retain(|c| c != name);
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<String>, ToolError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self.live())
    }
}

/// pid of a process that has already exited
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Settings pointing at a scratch state file, without signal handling
pub fn test_settings(dir: &TempDir) -> Settings {
    Settings {
        state_file: Some(dir.path().join("clusters.jsonl")),
        cleanup_on_interrupt: false,
        teardown_timeout_secs: 5,
        ..Default::default()
    }
}
