//! Cleanup coordination
//!
//! Every cluster id moves through `Live -> TeardownRequested -> Torn` exactly
//! once. Release, process exit, interrupt signals and the startup orphan
//! sweep all go through [`CleanupCoordinator::claim`]; only the trigger that
//! wins the claim performs a deletion, all others are no-ops.
//!
//! Deletion for exit and interrupt triggers is handed to a background worker
//! so the trigger itself never blocks on the provisioning tool.
//!
//! Every coordinator registers an owner id for as long as it exists. State
//! records carry that id and the owning pid, which is how the orphan sweep
//! tells a crashed run from a sibling that is still using its clusters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::kind::{ClusterHandle, ClusterProcessController, ClusterStatus};
use crate::state::{current_host, process_alive, StateRecord, StateStore};

/// Exit code after SIGINT
pub const EXIT_CODE_INTERRUPT: i32 = 130;
/// Exit code after SIGTERM
pub const EXIT_CODE_TERMINATE: i32 = 143;

/// Slack on top of a handle's creation timeout before the worker stops
/// waiting for it to settle
const SETTLE_MARGIN: Duration = Duration::from_secs(5);

/// Owner ids of the coordinators alive in this process
fn active_owners() -> &'static DashSet<Uuid> {
    static OWNERS: OnceLock<DashSet<Uuid>> = OnceLock::new();
    OWNERS.get_or_init(DashSet::new)
}

/// Whether the run that wrote `record` is still around
///
/// Records from this process belong to a live run only while their owning
/// coordinator exists. Records from other processes are alive while that
/// process is.
pub fn owner_alive(record: &StateRecord) -> bool {
    if record.pid == std::process::id() {
        record
            .owner
            .is_some_and(|owner| active_owners().contains(&owner))
    } else {
        process_alive(record.pid, record.created_at)
    }
}

/// Per-id teardown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownState {
    Live,
    TeardownRequested,
    Torn,
}

/// Result of an inline teardown request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// This call won the claim and the cluster is gone
    Deleted,
    /// This call won the claim but deletion failed; the state record stays
    Failed,
    /// Another trigger already claimed the id
    AlreadyClaimed,
    /// The id is not tracked by this coordinator
    Untracked,
}

/// A failed orphan deletion, reported at session end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCleanupFailure {
    pub id: Uuid,
    pub name: String,
    pub reason: String,
}

impl std::fmt::Display for OrphanCleanupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.id, self.reason)
    }
}

/// Outcome of an orphan sweep or purge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Live clusters that were deleted
    pub deleted: Vec<String>,
    /// Records whose cluster was already gone
    pub stale_removed: Vec<String>,
    /// Records left alone (kept, other host, owner still running, or
    /// claimed elsewhere)
    pub skipped: usize,
    pub failures: Vec<OrphanCleanupFailure>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail_all(&mut self, records: &[StateRecord], reason: &str) {
        self.failures
            .extend(records.iter().map(|r| OrphanCleanupFailure {
                id: r.id,
                name: r.name.clone(),
                reason: reason.to_string(),
            }));
    }
}

/// Counters for teardowns performed by this coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownStats {
    pub deleted: usize,
    pub failed: usize,
}

// ============================================================================
// Claim table and deletion
// ============================================================================

/// Shared between the coordinator and its worker
struct Reaper {
    controller: ClusterProcessController,
    store: Arc<StateStore>,
    teardown_timeout: Duration,
    states: DashMap<Uuid, TeardownState>,
    deleted: AtomicUsize,
    failed: AtomicUsize,
}

impl Reaper {
    fn claim(&self, id: Uuid) -> bool {
        match self.states.entry(id) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == TeardownState::Live {
                    entry.insert(TeardownState::TeardownRequested);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(TeardownState::TeardownRequested);
                true
            }
        }
    }

    fn mark_torn(&self, id: Uuid) {
        self.states.insert(id, TeardownState::Torn);
    }

    /// Delete a claimed handle; the state record is removed only on success
    async fn delete_claimed(&self, handle: &ClusterHandle) -> TeardownOutcome {
        let outcome = match self
            .controller
            .delete(handle, self.teardown_timeout)
            .await
        {
            Ok(()) => {
                info!("Deleted cluster '{}'", handle.name());
                self.forget_record(handle.id(), handle.name());
                self.deleted.fetch_add(1, Ordering::SeqCst);
                TeardownOutcome::Deleted
            }
            Err(e) => {
                warn!(
                    "Teardown of '{}' failed, leaving it for the next orphan sweep: {}",
                    handle.name(),
                    e
                );
                self.failed.fetch_add(1, Ordering::SeqCst);
                TeardownOutcome::Failed
            }
        };
        self.mark_torn(handle.id());
        outcome
    }

    /// Best-effort deletion of whatever a failed creation left behind
    async fn discard_partial(&self, handle: &ClusterHandle) {
        info!("Cleaning up after failed creation of '{}'", handle.name());
        match self
            .controller
            .delete_named(handle.name(), handle.kubeconfig_path(), self.teardown_timeout)
            .await
        {
            Ok(()) => self.forget_record(handle.id(), handle.name()),
            Err(e) => warn!(
                "Cleanup of failed cluster '{}' did not complete: {}",
                handle.name(),
                e
            ),
        }
        self.mark_torn(handle.id());
    }

    fn forget_record(&self, id: Uuid, name: &str) {
        if let Err(e) = self.store.remove(id) {
            warn!("Could not remove state record for '{}': {}", name, e);
        }
    }
}

/// Work for the deletion worker
enum Job {
    /// Delete a claimed handle once its creation settles
    Teardown(Arc<ClusterHandle>),
    /// Delete what a failed or cancelled creation left behind
    Discard(Arc<ClusterHandle>),
}

/// Pending background deletions
#[derive(Clone)]
struct Pending(Arc<watch::Sender<usize>>);

impl Pending {
    fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self(Arc::new(tx))
    }

    fn add(&self) {
        self.0.send_modify(|n| *n += 1);
    }

    fn done(&self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn count(&self) -> usize {
        *self.0.borrow()
    }

    async fn wait_idle(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

async fn run_worker(reaper: Arc<Reaper>, pending: Pending, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        let reaper = reaper.clone();
        let pending = pending.clone();
        tokio::spawn(async move {
            match job {
                Job::Teardown(handle) => teardown_when_settled(&reaper, &handle).await,
                Job::Discard(handle) => reaper.discard_partial(&handle).await,
            }
            pending.done();
        });
    }
    debug!("Cleanup worker stopped");
}

async fn teardown_when_settled(reaper: &Reaper, handle: &ClusterHandle) {
    let limit = Duration::from_secs(handle.config().timeout_secs) + SETTLE_MARGIN;
    match timeout(limit, handle.wait_settled()).await {
        Ok(ClusterStatus::Ready) => {
            reaper.delete_claimed(handle).await;
        }
        Ok(status) => {
            debug!(
                "Skipping teardown of '{}' in status {}",
                handle.name(),
                status
            );
            reaper.mark_torn(handle.id());
        }
        Err(_) => {
            warn!(
                "Cluster '{}' still provisioning after {}s, giving up on it",
                handle.name(),
                limit.as_secs()
            );
            let _ = handle.transition(ClusterStatus::Failed);
            reaper.discard_partial(handle).await;
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Single authority for tearing clusters down
pub struct CleanupCoordinator {
    reaper: Arc<Reaper>,
    handles: DashMap<Uuid, Arc<ClusterHandle>>,
    queue: mpsc::UnboundedSender<Job>,
    pending: Pending,
    orphan_failures: Mutex<Vec<OrphanCleanupFailure>>,
    host: String,
    owner: Uuid,
}

impl CleanupCoordinator {
    /// Create a coordinator and spawn its deletion worker
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        controller: ClusterProcessController,
        store: Arc<StateStore>,
        teardown_timeout: Duration,
    ) -> Arc<Self> {
        let reaper = Arc::new(Reaper {
            controller,
            store,
            teardown_timeout,
            states: DashMap::new(),
            deleted: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });
        let pending = Pending::new();
        let (queue, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_worker(reaper.clone(), pending.clone(), rx));

        let owner = Uuid::new_v4();
        active_owners().insert(owner);

        Arc::new(Self {
            reaper,
            handles: DashMap::new(),
            queue,
            pending,
            orphan_failures: Mutex::new(Vec::new()),
            host: current_host(),
            owner,
        })
    }

    /// Override the host name used to decide record ownership
    pub fn with_host(mut self: Arc<Self>, host: impl Into<String>) -> Arc<Self> {
        if let Some(this) = Arc::get_mut(&mut self) {
            this.host = host.into();
        }
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Id written into the state records of clusters created under this
    /// coordinator
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// State record for a handle created under this coordinator
    pub fn record_for(&self, handle: &ClusterHandle) -> StateRecord {
        StateRecord {
            owner: Some(self.owner),
            ..handle.to_record(std::process::id(), Some(self.host.clone()))
        }
    }

    /// Start tracking a handle as `Live`
    pub fn track(&self, handle: Arc<ClusterHandle>) {
        let id = handle.id();
        self.reaper.states.insert(id, TeardownState::Live);
        self.handles.insert(id, handle);
    }

    /// Stop tracking a handle whose creation did not complete
    ///
    /// The handle ends `Failed`. With `delete_partial` the worker makes one
    /// bounded attempt to delete whatever the provisioning tool left behind
    /// and drops the state record if there is one.
    pub fn discard(&self, handle: &Arc<ClusterHandle>, delete_partial: bool) {
        let _ = handle.transition(ClusterStatus::Failed);
        self.handles.remove(&handle.id());
        if delete_partial {
            self.reaper
                .states
                .insert(handle.id(), TeardownState::TeardownRequested);
            self.enqueue(Job::Discard(handle.clone()), handle.name());
        } else {
            self.reaper.mark_torn(handle.id());
        }
    }

    /// Number of handles still tracked
    pub fn tracked(&self) -> usize {
        self.handles.len()
    }

    pub fn is_tracked(&self, id: Uuid) -> bool {
        self.reaper.states.contains_key(&id)
    }

    pub fn state(&self, id: Uuid) -> Option<TeardownState> {
        self.reaper.states.get(&id).map(|s| *s)
    }

    /// Atomically move `id` from `Live` to `TeardownRequested`
    ///
    /// Returns true for exactly one caller per id. Unknown ids can be claimed
    /// once, which is how the orphan sweep takes ownership of a record.
    pub fn claim(&self, id: Uuid) -> bool {
        self.reaper.claim(id)
    }

    /// Tear a tracked cluster down inline
    ///
    /// Teardown failures are logged and reported in the outcome, never
    /// returned as errors.
    pub async fn teardown(&self, id: Uuid) -> TeardownOutcome {
        let handle = match self.handles.get(&id) {
            Some(handle) => handle.clone(),
            None => return TeardownOutcome::Untracked,
        };
        if !self.claim(id) {
            debug!("Teardown of '{}' already claimed", handle.name());
            return TeardownOutcome::AlreadyClaimed;
        }
        self.handles.remove(&id);
        self.reaper.delete_claimed(&handle).await
    }

    /// Claim every live, non-kept handle and hand it to the worker
    ///
    /// Never blocks; safe to call from signal handlers, exit hooks and `Drop`.
    /// Returns the number of handles handed off.
    pub fn request_all(&self) -> usize {
        let candidates: Vec<Arc<ClusterHandle>> = self
            .handles
            .iter()
            .filter(|h| !h.keep())
            .map(|h| h.value().clone())
            .collect();

        let mut requested = 0;
        for handle in candidates {
            if !self.claim(handle.id()) {
                continue;
            }
            self.handles.remove(&handle.id());
            let name = handle.name().to_string();
            if self.enqueue(Job::Teardown(handle), &name) {
                requested += 1;
            }
        }

        if requested > 0 {
            info!("Requested teardown of {} cluster(s)", requested);
        }
        requested
    }

    fn enqueue(&self, job: Job, name: &str) -> bool {
        self.pending.add();
        if self.queue.send(job).is_err() {
            error!("Cleanup worker is gone, cannot tear down '{}'", name);
            self.pending.done();
            return false;
        }
        true
    }

    /// Number of handed-off deletions still running
    pub fn pending(&self) -> usize {
        self.pending.count()
    }

    /// Wait for every handed-off deletion to finish
    pub async fn drain(&self) {
        self.pending.wait_idle().await;
    }

    /// Exit hook: hand off whatever is still live and wait for it
    pub async fn shutdown(&self) {
        self.request_all();
        self.drain().await;
    }

    /// Exit hook for synchronous code such as `Drop`
    ///
    /// On a multi-threaded runtime the handed-off deletions are awaited in
    /// place. Anywhere else the Ready handles are deleted on a helper thread
    /// with its own runtime, and creations still in flight are left to the
    /// next orphan sweep.
    pub fn shutdown_blocking(&self) {
        match Handle::try_current() {
            Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
                self.request_all();
                tokio::task::block_in_place(|| runtime.block_on(self.drain()));
            }
            _ => self.teardown_on_helper_thread(),
        }
    }

    fn teardown_on_helper_thread(&self) {
        let pending = self.pending();
        if pending > 0 {
            warn!(
                "{} handed-off teardown(s) cannot finish while this thread blocks",
                pending
            );
        }

        let mut claimed = Vec::new();
        for handle in self.handles.iter().map(|h| h.value().clone()).collect::<Vec<_>>() {
            if handle.keep() {
                continue;
            }
            if !handle.is_ready() {
                warn!(
                    "Cluster '{}' is {}, leaving it for the next orphan sweep",
                    handle.name(),
                    handle.status()
                );
                continue;
            }
            if self.claim(handle.id()) {
                self.handles.remove(&handle.id());
                claimed.push(handle);
            }
        }
        if claimed.is_empty() {
            return;
        }

        let reaper = self.reaper.clone();
        let worker = std::thread::spawn(move || -> std::io::Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async {
                for handle in &claimed {
                    reaper.delete_claimed(handle).await;
                }
            });
            Ok(())
        });
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Could not start a runtime for teardown: {}", e),
            Err(_) => error!("Teardown thread panicked"),
        }
    }

    pub fn stats(&self) -> TeardownStats {
        TeardownStats {
            deleted: self.reaper.deleted.load(Ordering::SeqCst),
            failed: self.reaper.failed.load(Ordering::SeqCst),
        }
    }

    /// Orphan failures collected so far
    pub fn orphan_failures(&self) -> Vec<OrphanCleanupFailure> {
        self.orphan_failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    /// Delete clusters recorded by runs that are gone
    ///
    /// Records tracked here, kept records, records from other hosts and
    /// records whose owner is still running are left alone. A record whose cluster still exists is deleted and then
    /// removed; a record whose cluster is already gone is removed without a
    /// deletion attempt. Nothing here is fatal.
    pub async fn sweep_orphans(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut orphans = Vec::new();

        for record in self.reaper.store.load() {
            if self.is_tracked(record.id) {
                continue;
            }
            if record.keep {
                debug!("Leaving kept cluster '{}'", record.name);
                report.skipped += 1;
            } else if !record.is_local_to(&self.host) {
                debug!(
                    "Leaving cluster '{}' recorded on host {:?}",
                    record.name, record.host
                );
                report.skipped += 1;
            } else if owner_alive(&record) {
                debug!(
                    "Leaving cluster '{}' owned by running process {}",
                    record.name, record.pid
                );
                report.skipped += 1;
            } else {
                orphans.push(record);
            }
        }

        if !orphans.is_empty() {
            info!("Found {} orphaned cluster record(s)", orphans.len());
            self.reap(orphans, &mut report).await;
        }
        self.record_failures(&report);
        report
    }

    /// Emergency purge: delete every cluster recorded on this host,
    /// including kept ones
    pub async fn purge_recorded(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let (local, foreign): (Vec<_>, Vec<_>) = self
            .reaper
            .store
            .load()
            .into_iter()
            .partition(|r| r.is_local_to(&self.host));

        for record in &foreign {
            warn!(
                "Cannot reach cluster '{}' recorded on host {:?}",
                record.name, record.host
            );
        }
        report.skipped += foreign.len();

        for record in &local {
            self.handles.remove(&record.id);
        }
        self.reap(local, &mut report).await;
        self.record_failures(&report);
        report
    }

    async fn reap(&self, records: Vec<StateRecord>, report: &mut SweepReport) {
        if records.is_empty() {
            return;
        }
        let live: HashSet<String> = match self.reaper.controller.live_clusters().await {
            Ok(live) => live.into_iter().collect(),
            Err(e) => {
                warn!("Could not list clusters, keeping all records: {}", e);
                report.fail_all(&records, &e.to_string());
                return;
            }
        };

        for record in records {
            if !self.claim(record.id) {
                report.skipped += 1;
                continue;
            }

            if !live.contains(&record.name) {
                info!("Removing stale record for '{}' (cluster is gone)", record.name);
                self.reaper.forget_record(record.id, &record.name);
                self.reaper.mark_torn(record.id);
                report.stale_removed.push(record.name);
                continue;
            }

            match self
                .reaper
                .controller
                .delete_named(
                    &record.name,
                    record.kubeconfig_path.as_deref(),
                    self.reaper.teardown_timeout,
                )
                .await
            {
                Ok(()) => {
                    info!("Deleted orphaned cluster '{}'", record.name);
                    self.reaper.forget_record(record.id, &record.name);
                    report.deleted.push(record.name);
                }
                Err(e) => {
                    warn!("Failed to delete orphaned cluster '{}': {}", record.name, e);
                    report.failures.push(OrphanCleanupFailure {
                        id: record.id,
                        name: record.name,
                        reason: e.to_string(),
                    });
                }
            }
            self.reaper.mark_torn(record.id);
        }
    }

    fn record_failures(&self, report: &SweepReport) {
        if report.failures.is_empty() {
            return;
        }
        if let Ok(mut failures) = self.orphan_failures.lock() {
            failures.extend(report.failures.iter().cloned());
        }
    }

    /// Tear everything down on SIGINT or SIGTERM, then exit
    ///
    /// The signal task only claims and hands off; deletion runs on the
    /// worker. The process exits with 130 (SIGINT) or 143 (SIGTERM) once
    /// the handed-off deletions finish.
    pub fn install_interrupt_handler(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let code = wait_for_signal().await;
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            warn!("Interrupted, tearing down clusters");
            coordinator.request_all();
            coordinator.drain().await;
            std::process::exit(code);
        })
    }
}

impl Drop for CleanupCoordinator {
    fn drop(&mut self) {
        active_owners().remove(&self.owner);
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = ctrl_c() => EXIT_CODE_INTERRUPT,
            _ = term.recv() => EXIT_CODE_TERMINATE,
        },
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            ctrl_c().await;
            EXIT_CODE_INTERRUPT
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    ctrl_c().await;
    EXIT_CODE_INTERRUPT
}
