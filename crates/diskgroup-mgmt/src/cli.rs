use crate::admin::{AdminClient, HdfsAdminClient};
use crate::config::MigrateConfig;
use crate::monitor::DecommissionMonitor;
use crate::orchestrator::{
    MigrationBatch, MigrationOrchestrator, MigrationRequest, OrchestratorError,
};
use crate::registry::DiskGroupRegistry;
use crate::report::NodeStatus;
use crate::topology::ClusterConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "dg-mgmt")]
#[command(about = "Disk-group management CLI", long_about = None)]
pub struct Cli {
    /// Settings file (.toml or .json)
    #[arg(short, long, env = "DG_MGMT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Move nodes between disk groups
    Migrate {
        /// File with one `host source_group dest_group` triple per line
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Requests given as `host,source_group,dest_group`
        requests: Vec<MigrationRequest>,
    },
    /// Print the decommission status reported by the control plane
    Status { hosts: Vec<String> },
    /// Validate a cluster config against the current membership files
    Validate { cluster_config: PathBuf },
    /// Write the initial workers and disk-group files
    Provision {
        cluster_config: PathBuf,
        experiment: String,
        #[arg(long)]
        domain: Option<String>,
    },
}

impl Cli {
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Migrate {
                ref file,
                ref requests,
            } => migrate(&config, file.as_deref(), requests, &cancel).await,
            Command::Status { ref hosts } => status(&config, hosts).await,
            Command::Validate { ref cluster_config } => validate(&config, cluster_config),
            Command::Provision {
                ref cluster_config,
                ref experiment,
                ref domain,
            } => provision(&config, cluster_config, experiment, domain.as_deref()).await,
        }
    }

    fn load_config(&self) -> Result<MigrateConfig> {
        match &self.config {
            Some(path) if path.exists() => MigrateConfig::from_file(path),
            Some(path) => {
                tracing::warn!("Config file not found, using defaults: {}", path.display());
                Ok(MigrateConfig::default())
            }
            None => Ok(MigrateConfig::default()),
        }
    }
}

fn build_batch(file: Option<&Path>, requests: &[MigrationRequest]) -> Result<MigrationBatch> {
    let mut all = Vec::new();
    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading migration list {}", path.display()))?;
        all.extend(MigrationBatch::parse(&text)?.requests().iter().cloned());
    }
    all.extend(requests.iter().cloned());
    Ok(MigrationBatch::new(all)?)
}

async fn migrate(
    config: &MigrateConfig,
    file: Option<&Path>,
    requests: &[MigrationRequest],
    cancel: &CancellationToken,
) -> Result<()> {
    let batch = build_batch(file, requests)?;
    let registry =
        DiskGroupRegistry::open(config.conf_dir())?.with_lock_file(config.lock_file());
    let _lock = registry.lock()?;

    let admin: Arc<dyn AdminClient> = Arc::new(HdfsAdminClient::from_config(config));
    let orchestrator =
        MigrationOrchestrator::new(registry, admin, DecommissionMonitor::from_config(config));

    match orchestrator.migrate_batch(&batch, cancel).await {
        Ok(report) => {
            println!(
                "Migrated {} node(s) after {} poll cycle(s):",
                report.migrated.len(),
                report.poll_cycles
            );
            for req in batch.requests() {
                println!("  {}", req);
            }
            Ok(())
        }
        Err(OrchestratorError::PartialCommitFailure {
            failed_hosts,
            migrated,
        }) => {
            for host in &migrated {
                println!("  migrated: {}", host);
            }
            for (host, failure) in &failed_hosts {
                println!("  FAILED:   {} ({})", host, failure);
            }
            anyhow::bail!(
                "{} of {} node(s) failed to commit",
                failed_hosts.len(),
                batch.len()
            )
        }
        Err(e) => Err(e.into()),
    }
}

async fn status(config: &MigrateConfig, hosts: &[String]) -> Result<()> {
    let admin = HdfsAdminClient::from_config(config);
    let report = admin.fetch_report().await?;

    println!("{:<48} {:<16}", "HOSTNAME", "STATUS");
    println!("{}", "-".repeat(64));

    if hosts.is_empty() {
        for (host, status) in report.statuses() {
            println!("{:<48} {:<16}", host, status);
        }
    } else {
        for host in hosts {
            println!("{:<48} {:<16}", host, report.status_of(host));
        }
        if hosts.iter().any(|h| report.status_of(h) == NodeStatus::Missing) {
            anyhow::bail!("Some requested hosts are missing from the report");
        }
    }
    Ok(())
}

fn validate(config: &MigrateConfig, cluster_config: &Path) -> Result<()> {
    let registry = DiskGroupRegistry::open(config.conf_dir())?;
    let topology = registry.load_topology(cluster_config)?;

    println!(
        "{:<32} {:>8} {:>8} {:>9}",
        "DISK GROUP", "POLICY", "MEMBERS", "EXCLUDED"
    );
    println!("{}", "-".repeat(60));
    for group in topology.groups.values() {
        println!(
            "{:<32} {:>8} {:>8} {:>9}",
            group.name,
            group.policy.to_string(),
            group.members.len(),
            group.excluded.len()
        );
    }
    println!(
        "{} of {} nodes assigned",
        topology.member_count(),
        topology.total_nodes
    );

    topology.validate_membership()?;
    Ok(())
}

async fn provision(
    config: &MigrateConfig,
    cluster_config: &Path,
    experiment: &str,
    domain: Option<&str>,
) -> Result<()> {
    let cluster = ClusterConfig::from_file(cluster_config)?;
    cluster.validate()?;

    if cluster.total_num_nodes < 2 {
        anyhow::bail!("Cluster needs at least one worker besides the control node");
    }
    // node0 is the control node.
    let domain = domain.unwrap_or(config.host_domain.as_str());
    let range = format!(
        "node[1-{}].{}.{}",
        cluster.total_num_nodes - 1,
        experiment,
        domain
    );

    let admin = HdfsAdminClient::from_config(config);
    let resolved = admin.resolve_hostnames(&range).await?;
    for (target, fqdn) in &resolved {
        tracing::info!("{} -> {}", target, fqdn);
    }
    let workers: Vec<String> = resolved.into_iter().map(|(_, fqdn)| fqdn).collect();

    let registry =
        DiskGroupRegistry::create(config.conf_dir())?.with_lock_file(config.lock_file());
    let _lock = registry.lock()?;
    let topology = registry.provision(&cluster, &workers)?;
    for group in topology.groups.values() {
        println!("{}: {} nodes", group.name, group.members.len());
    }
    println!("{} workers written to {}", workers.len(), registry.workers_path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClusterLock, RegistryError};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_cli_migrate_requests() {
        let cli = Cli::parse_from([
            "dg-mgmt",
            "migrate",
            "node5,RS-6-3-1024k,RS-7-3-1024k",
            "node6,RS-6-3-1024k,RS-7-3-1024k",
        ]);
        match &cli.command {
            Command::Migrate { file, requests } => {
                assert!(file.is_none());
                assert_eq!(requests.len(), 2);
                assert_eq!(requests[1].hostname, "node6");
            }
            _ => panic!("Expected Migrate command"),
        }
    }

    #[test]
    fn test_cli_migrate_rejects_bad_triple() {
        assert!(Cli::try_parse_from(["dg-mgmt", "migrate", "node5,RS-6-3-1024k"]).is_err());
    }

    #[test]
    fn test_cli_migrate_file_flag() {
        let cli = Cli::parse_from(["dg-mgmt", "migrate", "--file", "/tmp/moves.txt"]);
        match &cli.command {
            Command::Migrate { file, requests } => {
                assert_eq!(file.as_deref(), Some(Path::new("/tmp/moves.txt")));
                assert!(requests.is_empty());
            }
            _ => panic!("Expected Migrate command"),
        }
    }

    #[test]
    fn test_cli_status_hosts() {
        let cli = Cli::parse_from(["dg-mgmt", "status", "a", "b"]);
        match &cli.command {
            Command::Status { hosts } => assert_eq!(hosts, &["a", "b"]),
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_cli_provision() {
        let cli = Cli::parse_from([
            "dg-mgmt",
            "--config",
            "/etc/dg-mgmt.toml",
            "provision",
            "cluster.json",
            "exp1",
            "--domain",
            "utah.cloudlab.us",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/dg-mgmt.toml")));
        match &cli.command {
            Command::Provision {
                cluster_config,
                experiment,
                domain,
            } => {
                assert_eq!(cluster_config, &PathBuf::from("cluster.json"));
                assert_eq!(experiment, "exp1");
                assert_eq!(domain.as_deref(), Some("utah.cloudlab.us"));
            }
            _ => panic!("Expected Provision command"),
        }
    }

    #[test]
    fn test_build_batch_merges_file_and_args() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a RS-6-3-1024k RS-7-3-1024k").unwrap();
        let extra = vec![MigrationRequest::new("b", "RS-6-3-1024k", "RS-7-3-1024k")];
        let batch = build_batch(Some(file.path()), &extra).unwrap();
        assert_eq!(batch.hostnames(), vec!["a", "b"]);
    }

    #[test]
    fn test_build_batch_duplicate_across_sources() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a RS-6-3-1024k RS-7-3-1024k").unwrap();
        let extra = vec![MigrationRequest::new("a", "RS-6-3-1024k", "RS-7-3-1024k")];
        assert!(build_batch(Some(file.path()), &extra).is_err());
    }

    #[test]
    fn test_build_batch_empty() {
        assert!(build_batch(None, &[]).is_err());
    }

    fn locked_config(dir: &Path) -> (MigrateConfig, ClusterLock) {
        let config = MigrateConfig {
            conf_dir: Some(dir.join("conf")),
            lock_file: Some(dir.join("migrate.lock")),
            remote_shell: String::from("/bin/true"),
            ..MigrateConfig::default()
        };
        std::fs::create_dir_all(config.conf_dir()).unwrap();
        let held = ClusterLock::acquire(&config.lock_file()).unwrap();
        (config, held)
    }

    fn is_locked_on(err: &anyhow::Error, path: &Path) -> bool {
        matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::Locked(p)) if p == path
        )
    }

    #[tokio::test]
    async fn test_migrate_takes_configured_lock_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, _held) = locked_config(dir.path());
        let requests = vec![MigrationRequest::new("a", "RS-6-3-1024k", "RS-7-3-1024k")];

        let err = migrate(&config, None, &requests, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(is_locked_on(&err, &config.lock_file()), "{err:#}");
    }

    #[tokio::test]
    async fn test_provision_takes_configured_lock_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, _held) = locked_config(dir.path());
        let mut cluster = NamedTempFile::new().unwrap();
        writeln!(
            cluster,
            r#"{{"totalNumNodes": 10, "diskGroups": [{{"ecPolicy": "RS-6-3-1024k", "numNodes": 9}}]}}"#
        )
        .unwrap();

        let err = provision(&config, cluster.path(), "exp1", None).await.unwrap_err();
        assert!(is_locked_on(&err, &config.lock_file()), "{err:#}");
        assert!(!config.conf_dir().join("workers").exists());
    }
}
