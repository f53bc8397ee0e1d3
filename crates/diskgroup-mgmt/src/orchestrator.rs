use crate::admin::{AdminClient, AdminError};
use crate::monitor::{DecommissionFailure, DecommissionMonitor, MonitorOutcome};
use crate::registry::{DiskGroupRegistry, RegistryError};
use crate::topology::EcPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Migration batch is empty")]
    EmptyBatch,
    #[error("Host {0} appears more than once in the batch")]
    DuplicateHost(String),
    #[error("Host {host} has the same source and destination group {group}")]
    SameGroup { host: String, group: String },
    #[error("Invalid migration request on line {line}: {reason}")]
    InvalidRequest { line: usize, reason: String },
    #[error("{host} is not a member of disk group {group}")]
    NotAMember { host: String, group: String },
    #[error("Decommission failed ({kind}) for: {}", .hosts.join(", "))]
    DecommissionFailed {
        kind: DecommissionFailure,
        hosts: Vec<String>,
    },
    #[error("Decommission cancelled after {cycles} poll cycle(s)")]
    Cancelled { cycles: u32 },
    #[error("Commit failed for {} host(s): {}", .failed_hosts.len(), describe_failures(.failed_hosts))]
    PartialCommitFailure {
        failed_hosts: BTreeMap<String, CommitFailure>,
        migrated: Vec<String>,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Admin(#[from] AdminError),
}

fn describe_failures(failures: &BTreeMap<String, CommitFailure>) -> String {
    failures
        .iter()
        .map(|(host, f)| format!("{} [{}]", host, f))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub hostname: String,
    pub source_group: String,
    pub dest_group: String,
}

impl MigrationRequest {
    pub fn new(
        hostname: impl Into<String>,
        source_group: impl Into<String>,
        dest_group: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            source_group: source_group.into(),
            dest_group: dest_group.into(),
        }
    }
}

impl FromStr for MigrationRequest {
    type Err = String;

    /// Accepts `host,src,dst` or whitespace separated `host src dst`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        match fields.as_slice() {
            [host, src, dst] => Ok(Self::new(*host, *src, *dst)),
            _ => Err(format!(
                "expected `host,source_group,dest_group`, got {:?}",
                s
            )),
        }
    }
}

impl std::fmt::Display for MigrationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} -> {}", self.hostname, self.source_group, self.dest_group)
    }
}

/// Requests decommissioned together and then committed one node at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationBatch {
    requests: Vec<MigrationRequest>,
}

impl MigrationBatch {
    pub fn new(requests: Vec<MigrationRequest>) -> Result<Self, OrchestratorError> {
        if requests.is_empty() {
            return Err(OrchestratorError::EmptyBatch);
        }
        let mut seen = BTreeSet::new();
        for req in &requests {
            if req.source_group == req.dest_group {
                return Err(OrchestratorError::SameGroup {
                    host: req.hostname.clone(),
                    group: req.source_group.clone(),
                });
            }
            if !seen.insert(req.hostname.as_str()) {
                return Err(OrchestratorError::DuplicateHost(req.hostname.clone()));
            }
        }
        Ok(Self { requests })
    }

    pub fn single(
        hostname: impl Into<String>,
        source_group: impl Into<String>,
        dest_group: impl Into<String>,
    ) -> Result<Self, OrchestratorError> {
        Self::new(vec![MigrationRequest::new(hostname, source_group, dest_group)])
    }

    /// One request per line; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self, OrchestratorError> {
        let mut requests = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let req = line
                .parse::<MigrationRequest>()
                .map_err(|reason| OrchestratorError::InvalidRequest {
                    line: idx + 1,
                    reason,
                })?;
            requests.push(req);
        }
        Self::new(requests)
    }

    pub fn requests(&self) -> &[MigrationRequest] {
        &self.requests
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.requests.iter().map(|r| r.hostname.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Commit-phase step, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitStep {
    RemoveExclude,
    RemoveMember,
    StopDaemon,
    WipeLocalData,
    AddMember,
    ApplyExcludes,
    StartDaemon,
}

impl std::fmt::Display for CommitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitStep::RemoveExclude => "remove-exclude",
            CommitStep::RemoveMember => "remove-member",
            CommitStep::StopDaemon => "stop-daemon",
            CommitStep::WipeLocalData => "wipe-local-data",
            CommitStep::AddMember => "add-member",
            CommitStep::ApplyExcludes => "apply-excludes",
            CommitStep::StartDaemon => "start-daemon",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFailure {
    pub step: CommitStep,
    pub reason: String,
}

impl CommitFailure {
    fn at(step: CommitStep) -> impl FnOnce(String) -> Self {
        move |reason| Self { step, reason }
    }
}

impl std::fmt::Display for CommitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub migrated: Vec<String>,
    pub poll_cycles: u32,
}

/// Drives a batch through decommission, wipe/restart and re-admission.
pub struct MigrationOrchestrator {
    registry: DiskGroupRegistry,
    admin: Arc<dyn AdminClient>,
    monitor: DecommissionMonitor,
}

impl MigrationOrchestrator {
    pub fn new(
        registry: DiskGroupRegistry,
        admin: Arc<dyn AdminClient>,
        monitor: DecommissionMonitor,
    ) -> Self {
        Self {
            registry,
            admin,
            monitor,
        }
    }

    pub async fn migrate_one(
        &self,
        hostname: &str,
        source_group: &str,
        dest_group: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, OrchestratorError> {
        let batch = MigrationBatch::single(hostname, source_group, dest_group)?;
        self.migrate_batch(&batch, cancel).await
    }

    pub async fn migrate_batch(
        &self,
        batch: &MigrationBatch,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, OrchestratorError> {
        tracing::info!("Migrating {} node(s): {}", batch.len(), batch.hostnames().join(", "));

        self.preflight(batch)?;
        let poll_cycles = self.decommission(batch, cancel).await?;

        let mut migrated = Vec::new();
        let mut failed_hosts = BTreeMap::new();
        for req in batch.requests() {
            match self.commit(req).await {
                Ok(()) => {
                    tracing::info!("Migrated {}", req);
                    migrated.push(req.hostname.clone());
                }
                Err(failure) => {
                    tracing::error!("Commit failed for {} at {}", req.hostname, failure);
                    failed_hosts.insert(req.hostname.clone(), failure);
                }
            }
        }

        if !failed_hosts.is_empty() {
            return Err(OrchestratorError::PartialCommitFailure {
                failed_hosts,
                migrated,
            });
        }

        tracing::info!("Migration batch complete: {}", migrated.join(", "));
        Ok(BatchReport {
            migrated,
            poll_cycles,
        })
    }

    /// Checks every request against the persisted membership without writing
    /// anything.
    fn preflight(&self, batch: &MigrationBatch) -> Result<(), OrchestratorError> {
        let mut removals: BTreeMap<&str, usize> = BTreeMap::new();

        for req in batch.requests() {
            if !self.registry.is_member(&req.hostname, &req.source_group)? {
                return Err(OrchestratorError::NotAMember {
                    host: req.hostname.clone(),
                    group: req.source_group.clone(),
                });
            }
            if !self.registry.has_group(&req.dest_group) {
                return Err(RegistryError::UnknownGroup(req.dest_group.clone()).into());
            }
            *removals.entry(req.source_group.as_str()).or_default() += 1;
        }

        for (group, removing) in removals {
            let policy = EcPolicy::parse(group).map_err(RegistryError::from)?;
            let current = self.registry.members(group)?.len();
            let remaining = current.saturating_sub(removing);
            if remaining < policy.min_nodes() {
                return Err(RegistryError::BelowPolicyMinimum {
                    group: group.to_string(),
                    remaining,
                    required: policy.min_nodes(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Excludes every host, refreshes once and waits for the whole batch.
    /// Exclude edits stay in place on failure for operator inspection.
    async fn decommission(
        &self,
        batch: &MigrationBatch,
        cancel: &CancellationToken,
    ) -> Result<u32, OrchestratorError> {
        for req in batch.requests() {
            self.registry.add_exclude(&req.hostname, &req.source_group)?;
        }
        self.admin.apply_excludes().await?;

        let targets = batch.hostnames();
        let outcome = self
            .monitor
            .wait_for_decommission(self.admin.as_ref(), &targets, cancel)
            .await?;

        match outcome {
            MonitorOutcome::Success { cycles } => Ok(cycles),
            MonitorOutcome::Cancelled { cycles } => Err(OrchestratorError::Cancelled { cycles }),
            failed => {
                let (kind, hosts) = failed
                    .into_failure()
                    .unwrap_or((DecommissionFailure::TimedOut, Vec::new()));
                Err(OrchestratorError::DecommissionFailed { kind, hosts })
            }
        }
    }

    /// Moves one decommissioned node into its destination group. Stops at the
    /// first failing step, so a node whose daemon did not stop is never wiped.
    async fn commit(&self, req: &MigrationRequest) -> Result<(), CommitFailure> {
        let host = req.hostname.as_str();

        self.registry
            .remove_exclude(host, &req.source_group)
            .map_err(|e| e.to_string())
            .map_err(CommitFailure::at(CommitStep::RemoveExclude))?;
        self.registry
            .remove_member(host, &req.source_group)
            .map_err(|e| e.to_string())
            .map_err(CommitFailure::at(CommitStep::RemoveMember))?;

        self.admin
            .stop_daemon(host)
            .await
            .map_err(|e| e.to_string())
            .map_err(CommitFailure::at(CommitStep::StopDaemon))?;
        self.admin
            .wipe_local_data(host)
            .await
            .map_err(|e| e.to_string())
            .map_err(CommitFailure::at(CommitStep::WipeLocalData))?;

        self.registry
            .add_member(host, &req.dest_group)
            .map_err(|e| e.to_string())
            .map_err(CommitFailure::at(CommitStep::AddMember))?;
        self.admin
            .apply_excludes()
            .await
            .map_err(|e| e.to_string())
            .map_err(CommitFailure::at(CommitStep::ApplyExcludes))?;
        self.admin
            .start_daemon(host)
            .await
            .map_err(|e| e.to_string())
            .map_err(CommitFailure::at(CommitStep::StartDaemon))?;

        Ok(())
    }
}
