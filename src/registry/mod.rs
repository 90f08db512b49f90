//! In-process cluster registry
//!
//! Maps a [`ScopeKey`] to a live cluster handle with a reference count.
//! Each key has its own async mutex, so creating or deleting one cluster
//! never blocks another key, and callers racing on the same key wait for the
//! in-flight creation instead of starting a second one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupCoordinator, TeardownOutcome};
use crate::config::{ClusterConfig, ScopeKey};
use crate::kind::{
    leaves_partial_cluster, ClusterHandle, ClusterProcessController, ClusterStatus,
    ProvisioningError,
};
use crate::state::StateStore;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No cluster is held for {0}")]
    NotHeld(ScopeKey),
}

/// What a release did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other holders remain
    Retained { refcount: usize },
    /// Last holder gone; the cluster is kept
    Kept,
    /// Last holder gone; teardown was requested
    TornDown(TeardownOutcome),
}

struct RegistryEntry {
    handle: Arc<ClusterHandle>,
    refcount: usize,
}

#[derive(Default)]
struct SlotState {
    entry: Option<RegistryEntry>,
    last_failure: Option<ProvisioningError>,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    // bumped while the lock is held, before a failed creation releases it
    failures: AtomicU64,
}

/// Hands a creation to the coordinator as failed if it is dropped midway
struct CreationGuard<'a> {
    coordinator: &'a CleanupCoordinator,
    handle: Arc<ClusterHandle>,
    armed: bool,
}

impl<'a> CreationGuard<'a> {
    fn new(coordinator: &'a CleanupCoordinator, handle: Arc<ClusterHandle>) -> Self {
        Self {
            coordinator,
            handle,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Creation of '{}' was cancelled", self.handle.name());
            self.coordinator.discard(&self.handle, true);
        }
    }
}

/// Scope-keyed cache of live clusters
pub struct ClusterRegistry {
    controller: ClusterProcessController,
    coordinator: Arc<CleanupCoordinator>,
    store: Arc<StateStore>,
    slots: DashMap<ScopeKey, Arc<Slot>>,
}

impl ClusterRegistry {
    pub fn new(
        controller: ClusterProcessController,
        coordinator: Arc<CleanupCoordinator>,
        store: Arc<StateStore>,
    ) -> Self {
        Self {
            controller,
            coordinator,
            store,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: &ScopeKey) -> Arc<Slot> {
        self.slots.entry(key.clone()).or_default().clone()
    }

    /// Get the cluster for `key`, creating it if needed
    ///
    /// A Ready cluster already held under `key` is shared and its refcount
    /// incremented. Otherwise a new cluster is created, recorded in the state
    /// store and inserted with refcount 1. Callers that were waiting on a
    /// creation that failed receive that same error.
    pub async fn acquire(
        &self,
        key: &ScopeKey,
        config: &ClusterConfig,
    ) -> Result<Arc<ClusterHandle>, ProvisioningError> {
        let slot = self.slot(key);
        let seen_failures = slot.failures.load(Ordering::SeqCst);
        let mut state = slot.state.lock().await;

        if slot.failures.load(Ordering::SeqCst) != seen_failures {
            if let Some(err) = &state.last_failure {
                debug!("Creation for {} failed while waiting", key);
                return Err(err.clone());
            }
        }

        if let Some(entry) = state.entry.as_mut() {
            if entry.handle.is_ready() {
                entry.refcount += 1;
                debug!(
                    "Reusing cluster '{}' for {} (refcount {})",
                    entry.handle.name(),
                    key,
                    entry.refcount
                );
                return Ok(entry.handle.clone());
            }
            warn!(
                "Cluster '{}' for {} is {}, replacing it",
                entry.handle.name(),
                key,
                entry.handle.status()
            );
            state.entry = None;
        }

        match self.create(key, config).await {
            Ok(handle) => {
                state.last_failure = None;
                state.entry = Some(RegistryEntry {
                    handle: handle.clone(),
                    refcount: 1,
                });
                Ok(handle)
            }
            Err(e) => {
                state.last_failure = Some(e.clone());
                slot.failures.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn create(
        &self,
        key: &ScopeKey,
        config: &ClusterConfig,
    ) -> Result<Arc<ClusterHandle>, ProvisioningError> {
        let handle = self.controller.begin(config);
        info!("Creating cluster '{}' for {}", handle.name(), key);

        // tracked before the tool runs so an interrupt during creation
        // still finds it
        self.coordinator.track(handle.clone());
        let mut guard = CreationGuard::new(&self.coordinator, handle.clone());

        let limit = Duration::from_secs(config.timeout_secs);
        if let Err(e) = self.controller.provision(&handle, limit).await {
            guard.disarm();
            self.coordinator.discard(&handle, leaves_partial_cluster(&e));
            return Err(e);
        }

        let record = self.coordinator.record_for(&handle);
        if let Err(e) = self.store.upsert(record) {
            warn!("Could not record cluster '{}': {}", handle.name(), e);
            guard.disarm();
            let _ = handle.transition(ClusterStatus::Ready);
            self.coordinator.teardown(handle.id()).await;
            return Err(ProvisioningError::Persist {
                name: handle.name().to_string(),
                message: e.to_string(),
            });
        }

        guard.disarm();
        handle
            .transition(ClusterStatus::Ready)
            .map_err(|e| ProvisioningError::Config(e.to_string()))?;
        info!("Cluster '{}' is ready", handle.name());
        Ok(handle)
    }

    /// Drop one hold on `key`
    ///
    /// At refcount zero the entry is evicted and, unless the cluster is
    /// kept, torn down through the coordinator. Teardown failures never
    /// surface here.
    pub async fn release(&self, key: &ScopeKey) -> Result<ReleaseOutcome, RegistryError> {
        let slot = match self.slots.get(key) {
            Some(slot) => slot.clone(),
            None => return Err(RegistryError::NotHeld(key.clone())),
        };
        let mut state = slot.state.lock().await;

        let entry = state
            .entry
            .as_mut()
            .ok_or_else(|| RegistryError::NotHeld(key.clone()))?;
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return Ok(ReleaseOutcome::Retained {
                refcount: entry.refcount,
            });
        }

        let handle = entry.handle.clone();
        state.entry = None;

        if handle.keep() {
            info!(
                "Keeping cluster '{}' (context {})",
                handle.name(),
                handle.context_name()
            );
            return Ok(ReleaseOutcome::Kept);
        }

        debug!("Last hold on '{}' released", handle.name());
        let outcome = self.coordinator.teardown(handle.id()).await;
        Ok(ReleaseOutcome::TornDown(outcome))
    }

    /// Current refcount for `key`, if a cluster is held
    pub async fn refcount(&self, key: &ScopeKey) -> Option<usize> {
        let slot = self.slots.get(key).map(|s| s.clone())?;
        let state = slot.state.lock().await;
        state.entry.as_ref().map(|e| e.refcount)
    }

    /// Handle held for `key`, without taking a reference
    pub async fn get(&self, key: &ScopeKey) -> Option<Arc<ClusterHandle>> {
        let slot = self.slots.get(key).map(|s| s.clone())?;
        let state = slot.state.lock().await;
        state.entry.as_ref().map(|e| e.handle.clone())
    }

    /// Number of keys with a held cluster
    pub async fn len(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.iter().map(|s| s.value().clone()).collect();
        let mut held = 0;
        for slot in slots {
            if slot.state.lock().await.entry.is_some() {
                held += 1;
            }
        }
        held
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
