//! Ephemeral kind clusters for test suites
//!
//! A [`Session`] hands out clusters keyed by test scope and configuration,
//! shares them between callers with a reference count and tears each one
//! down exactly once, whether the trigger is a release, the end of the
//! session, an interrupt, or the next run's orphan sweep.

pub mod cleanup;
pub mod cli;
pub mod config;
pub mod kind;
pub mod registry;
pub mod session;
pub mod state;
pub mod streaming;

pub use cleanup::{CleanupCoordinator, SweepReport, TeardownOutcome};
pub use config::{ClusterConfig, ClusterOverrides, Scope, ScopeKey, Settings, TestUnit};
pub use kind::{
    ClusterHandle, ClusterProcessController, ClusterStatus, KindProvisioner, Provisioner,
    ProvisioningError,
};
pub use registry::{ClusterRegistry, ReleaseOutcome};
pub use session::{emergency_cleanup, ClusterLease, Session, SessionError, SessionSummary};
pub use state::{StateRecord, StateStore};
