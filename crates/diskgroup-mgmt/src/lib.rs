#![warn(missing_docs)]

//! Disk-group management: moves storage nodes between erasure-coding disk
//! groups by decommissioning, wiping and re-admitting them.

/// Control-plane commands (refresh, report, daemon control).
pub mod admin;
/// `dg-mgmt` command-line interface.
pub mod cli;
/// Tool settings.
pub mod config;
/// Decommission polling.
pub mod monitor;
/// Batch migration workflow.
pub mod orchestrator;
/// File-backed disk-group membership.
pub mod registry;
/// Datanode report parsing.
pub mod report;
/// Cluster config and policy validation.
pub mod topology;

pub use admin::{AdminClient, AdminError, HdfsAdminClient};
pub use config::MigrateConfig;
pub use monitor::{DecommissionFailure, DecommissionMonitor, MonitorOutcome};
pub use orchestrator::{
    BatchReport, CommitFailure, CommitStep, MigrationBatch, MigrationOrchestrator,
    MigrationRequest, OrchestratorError,
};
pub use registry::{ClusterLock, DiskGroupRegistry, RegistryError};
pub use report::{ClusterReport, NodeRecord, NodeStatus};
pub use topology::{ClusterConfig, ClusterTopology, ConfigError, DiskGroup, EcPolicy};
