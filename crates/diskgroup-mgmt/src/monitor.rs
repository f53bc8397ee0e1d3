use crate::admin::{AdminClient, AdminError};
use crate::config::MigrateConfig;
use crate::report::{ClusterReport, NodeStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CHECKS: u32 = 20;

/// Why a decommission did not reach `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecommissionFailure {
    PartialMissing,
    TimedOut,
}

impl std::fmt::Display for DecommissionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecommissionFailure::PartialMissing => f.write_str("targets missing from report"),
            DecommissionFailure::TimedOut => f.write_str("timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorOutcome {
    Success { cycles: u32 },
    PartialMissing { missing: Vec<String>, cycle: u32 },
    TimedOut { pending: Vec<String>, cycles: u32 },
    Cancelled { cycles: u32 },
}

impl MonitorOutcome {
    /// Failure kind and the hosts it implicates. `None` for success and
    /// cancellation.
    pub fn into_failure(self) -> Option<(DecommissionFailure, Vec<String>)> {
        match self {
            MonitorOutcome::PartialMissing { missing, .. } => {
                Some((DecommissionFailure::PartialMissing, missing))
            }
            MonitorOutcome::TimedOut { pending, .. } => {
                Some((DecommissionFailure::TimedOut, pending))
            }
            MonitorOutcome::Success { .. } | MonitorOutcome::Cancelled { .. } => None,
        }
    }
}

/// Result of checking one report against the target set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Done,
    Pending(Vec<String>),
    Missing(Vec<String>),
}

pub fn classify(report: &ClusterReport, targets: &[String]) -> PollState {
    let missing: Vec<String> = targets
        .iter()
        .filter(|t| report.status_of(t) == NodeStatus::Missing)
        .cloned()
        .collect();
    if !missing.is_empty() {
        return PollState::Missing(missing);
    }

    let pending: Vec<String> = targets
        .iter()
        .filter(|t| !report.status_of(t).is_decommissioned())
        .cloned()
        .collect();
    if pending.is_empty() {
        PollState::Done
    } else {
        PollState::Pending(pending)
    }
}

/// Bounded poller waiting for a set of nodes to finish decommissioning.
///
/// Each cycle sleeps `interval` and then fetches one report, so the whole
/// wait never exceeds `interval * max_checks` plus report latency.
#[derive(Debug, Clone)]
pub struct DecommissionMonitor {
    interval: Duration,
    max_checks: u32,
}

impl Default for DecommissionMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_MAX_CHECKS)
    }
}

impl DecommissionMonitor {
    pub fn new(interval: Duration, max_checks: u32) -> Self {
        Self {
            interval,
            max_checks,
        }
    }

    pub fn from_config(config: &MigrateConfig) -> Self {
        Self::new(config.poll_interval(), config.max_checks)
    }

    pub async fn wait_for_decommission(
        &self,
        admin: &dyn AdminClient,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Result<MonitorOutcome, AdminError> {
        let mut pending = targets.to_vec();

        for cycle in 1..=self.max_checks {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!("Decommission monitor cancelled after {} cycle(s)", cycle - 1);
                    return Ok(MonitorOutcome::Cancelled { cycles: cycle - 1 });
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            let report = admin.fetch_report().await?;
            let statuses = report.statuses();
            tracing::info!(
                cycle,
                max_checks = self.max_checks,
                "Current datanode status: {:?}",
                statuses
            );

            match classify(&report, targets) {
                PollState::Done => {
                    tracing::info!(
                        "All {} target(s) decommissioned after {} cycle(s)",
                        targets.len(),
                        cycle
                    );
                    return Ok(MonitorOutcome::Success { cycles: cycle });
                }
                PollState::Missing(missing) => {
                    tracing::error!("Targets missing from the report: {}", missing.join(", "));
                    return Ok(MonitorOutcome::PartialMissing { missing, cycle });
                }
                PollState::Pending(still) => {
                    tracing::debug!("Still decommissioning: {}", still.join(", "));
                    pending = still;
                }
            }
        }

        tracing::error!(
            "Reached the maximum of {} checks, still pending: {}",
            self.max_checks,
            pending.join(", ")
        );
        Ok(MonitorOutcome::TimedOut {
            pending,
            cycles: self.max_checks,
        })
    }
}
