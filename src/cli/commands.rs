//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, output formatting is in display

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::cleanup::{CleanupCoordinator, SweepReport};
use crate::config::{default_settings_path, load_settings_from, ConfigError, Scope, Settings};
use crate::kind::{ClusterProcessController, Provisioner};
use crate::session::emergency_cleanup_with;
use crate::state::{current_host, StateRecord, StateStore};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0} cluster(s) could not be cleaned up")]
    Incomplete(usize),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// One row of `kindtest list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub name: String,
    pub scope: Scope,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub keep: bool,
    pub host: Option<String>,
    /// `None` when liveness was not probed or the host is remote
    pub live: Option<bool>,
}

// ============================================================================
// Pure business logic
// ============================================================================

/// Settings for a command invocation: the settings file, then the state
/// file override from the command line
pub fn resolve_settings(config: Option<&Path>, state_file: Option<PathBuf>) -> CommandResult<Settings> {
    let path = config.map(Path::to_path_buf).unwrap_or_else(default_settings_path);
    let mut settings = load_settings_from(&path)?;
    if state_file.is_some() {
        settings.state_file = state_file;
    }
    Ok(settings)
}

/// Join recorded clusters with the live cluster list
pub fn record_infos(records: &[StateRecord], live: Option<&[String]>, host: &str) -> Vec<RecordInfo> {
    records
        .iter()
        .map(|r| RecordInfo {
            name: r.name.clone(),
            scope: r.scope,
            pid: r.pid,
            created_at: r.created_at,
            keep: r.keep,
            host: r.host.clone(),
            live: live
                .filter(|_| r.is_local_to(host))
                .map(|names| names.iter().any(|n| n == &r.name)),
        })
        .collect()
}

/// Turn a report into the command result
pub fn check_report(report: &SweepReport) -> CommandResult<()> {
    if report.is_clean() {
        Ok(())
    } else {
        Err(CommandError::Incomplete(report.failures.len()))
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Emergency purge of every recorded cluster
pub async fn run_cleanup(settings: &Settings, provisioner: Arc<dyn Provisioner>) -> SweepReport {
    emergency_cleanup_with(settings, provisioner).await
}

/// Orphan sweep without starting a session
pub async fn run_sweep(settings: &Settings, provisioner: Arc<dyn Provisioner>) -> SweepReport {
    let store = Arc::new(StateStore::new(settings.state_file_path()));
    let coordinator = CleanupCoordinator::new(
        ClusterProcessController::new(provisioner),
        store,
        Duration::from_secs(settings.teardown_timeout_secs),
    );
    coordinator.sweep_orphans().await
}

/// Recorded clusters, optionally probed for liveness
pub async fn run_list(
    settings: &Settings,
    provisioner: Arc<dyn Provisioner>,
    probe: bool,
) -> Vec<RecordInfo> {
    let records = StateStore::new(settings.state_file_path()).load();

    let live = if probe && !records.is_empty() {
        match provisioner.list_clusters().await {
            Ok(live) => Some(live),
            Err(e) => {
                warn!("Could not list live clusters: {}", e);
                None
            }
        }
    } else {
        None
    };

    record_infos(&records, live.as_deref(), &current_host())
}
