//! Control-plane access: refresh, report and per-node daemon control.

use crate::config::MigrateConfig;
use crate::report::ClusterReport;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Label used for commands that run against the control node itself.
pub const CONTROL_NODE: &str = "control-node";

const UNREACHABLE_MARKERS: &[&str] = &[
    "exit code 255",
    "Connection refused",
    "Connection timed out",
    "Could not resolve hostname",
    "No route to host",
    "Name or service not known",
];

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Host {host} unreachable: {detail}")]
    Unreachable { host: String, detail: String },
    #[error("`{command}` on {host} failed (exit {code:?}): {stderr}")]
    NonZeroExit {
        host: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Refusing to run on {host}: {reason}")]
    Refused { host: String, reason: String },
}

impl AdminError {
    pub fn host(&self) -> Option<&str> {
        match self {
            AdminError::Unreachable { host, .. }
            | AdminError::NonZeroExit { host, .. }
            | AdminError::Refused { host, .. } => Some(host),
            AdminError::Spawn { .. } => None,
        }
    }
}

/// Commands the migration workflow needs from the control plane.
///
/// Every call blocks until the remote side acknowledged or failed. Nothing
/// is retried here.
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Makes the control plane re-read every exclude list.
    async fn apply_excludes(&self) -> Result<(), AdminError>;

    /// Fetches and parses the status of every known datanode.
    async fn fetch_report(&self) -> Result<ClusterReport, AdminError>;

    async fn stop_daemon(&self, host: &str) -> Result<(), AdminError>;

    async fn start_daemon(&self, host: &str) -> Result<(), AdminError>;

    /// Deletes the node's storage directory. The daemon must already be stopped.
    async fn wipe_local_data(&self, host: &str) -> Result<(), AdminError>;
}

/// Maps a failed command to `Unreachable` or `NonZeroExit` from the remote
/// shell's diagnostics.
pub fn classify_failure(host: &str, command: &str, code: Option<i32>, stderr: &str) -> AdminError {
    let stderr = stderr.trim();
    if UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        return AdminError::Unreachable {
            host: host.to_string(),
            detail: stderr.to_string(),
        };
    }
    AdminError::NonZeroExit {
        host: host.to_string(),
        command: command.to_string(),
        code,
        stderr: stderr.to_string(),
    }
}

/// Parses `pdsh` output lines of the form `<target>: <text>`.
pub fn parse_remote_output(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (target, text) = line.split_once(':')?;
            let target = target.trim();
            let text = text.trim();
            if target.is_empty() || text.is_empty() {
                return None;
            }
            Some((target.to_string(), text.to_string()))
        })
        .collect()
}

/// Trailing number of the first DNS label, so `node10.exp` sorts after `node9.exp`.
fn node_index(target: &str) -> u64 {
    let label = target.split('.').next().unwrap_or(target);
    let digits: String = label
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(u64::MAX)
}

/// HDFS control plane: `hdfs dfsadmin` locally, daemons through a parallel
/// remote shell (`pdsh -S -w <host> ...`).
#[derive(Debug, Clone)]
pub struct HdfsAdminClient {
    hdfs_bin: PathBuf,
    remote_shell: String,
    data_dir: PathBuf,
    command_timeout: Duration,
}

impl HdfsAdminClient {
    pub fn new(
        hdfs_bin: impl Into<PathBuf>,
        remote_shell: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            hdfs_bin: hdfs_bin.into(),
            remote_shell: remote_shell.into(),
            data_dir: data_dir.into(),
            command_timeout,
        }
    }

    pub fn from_config(config: &MigrateConfig) -> Self {
        Self::new(
            config.hdfs_bin(),
            config.remote_shell.clone(),
            config.data_dir(),
            config.command_timeout(),
        )
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    async fn run(&self, host: &str, program: &str, args: &[&str]) -> Result<String, AdminError> {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!("{}: running `{}`", host, command);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.command_timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(AdminError::Spawn { command, source }),
            Err(_) => {
                return Err(AdminError::Unreachable {
                    host: host.to_string(),
                    detail: format!("`{}` timed out after {:?}", command, self.command_timeout),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(host, &command, output.status.code(), &stderr));
        }
        Ok(stdout)
    }

    /// `-S` makes the remote shell exit with the largest remote exit code
    /// instead of 0, so a failed remote command is not mistaken for success.
    async fn run_remote(&self, host: &str, remote_args: &[&str]) -> Result<String, AdminError> {
        let mut args = vec!["-S", "-w", host];
        args.extend_from_slice(remote_args);
        self.run(host, &self.remote_shell, &args).await
    }

    async fn datanode_daemon(&self, host: &str, action: &str) -> Result<(), AdminError> {
        let hdfs = self.hdfs_bin.to_string_lossy().into_owned();
        let out = self
            .run_remote(host, &[&hdfs, "--daemon", action, "datanode"])
            .await?;
        if !out.trim().is_empty() {
            tracing::debug!("{}: {}", host, out.trim());
        }
        Ok(())
    }

    /// Runs `hostname -f` over a remote-shell host range such as
    /// `node[1-9].exp.apt.emulab.net` and returns `(target, fqdn)` pairs
    /// ordered by node number.
    pub async fn resolve_hostnames(
        &self,
        hosts: &str,
    ) -> Result<Vec<(String, String)>, AdminError> {
        let out = self.run_remote(hosts, &["hostname -f"]).await?;
        let mut resolved = parse_remote_output(&out);
        resolved.sort_by(|a, b| {
            node_index(&a.0)
                .cmp(&node_index(&b.0))
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(resolved)
    }
}

#[async_trait]
impl AdminClient for HdfsAdminClient {
    async fn apply_excludes(&self) -> Result<(), AdminError> {
        let hdfs = self.hdfs_bin.to_string_lossy().into_owned();
        self.run(CONTROL_NODE, &hdfs, &["dfsadmin", "-refreshNodes"])
            .await?;
        tracing::info!("Control plane refreshed exclude lists");
        Ok(())
    }

    async fn fetch_report(&self) -> Result<ClusterReport, AdminError> {
        let hdfs = self.hdfs_bin.to_string_lossy().into_owned();
        let text = self.run(CONTROL_NODE, &hdfs, &["dfsadmin", "-report"]).await?;
        Ok(ClusterReport::parse(&text))
    }

    async fn stop_daemon(&self, host: &str) -> Result<(), AdminError> {
        tracing::info!("{}: stopping datanode daemon", host);
        self.datanode_daemon(host, "stop").await
    }

    async fn start_daemon(&self, host: &str) -> Result<(), AdminError> {
        tracing::info!("{}: starting datanode daemon", host);
        self.datanode_daemon(host, "start").await
    }

    async fn wipe_local_data(&self, host: &str) -> Result<(), AdminError> {
        if !self.data_dir.is_absolute() || self.data_dir.parent().is_none() {
            return Err(AdminError::Refused {
                host: host.to_string(),
                reason: format!("unsafe data directory {}", self.data_dir.display()),
            });
        }
        tracing::info!("{}: deleting {}", host, self.data_dir.display());
        let dir = self.data_dir.to_string_lossy().into_owned();
        self.run_remote(host, &["rm", "-rf", &dir]).await?;
        Ok(())
    }
}
