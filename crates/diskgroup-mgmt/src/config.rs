use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HADOOP_HOME: &str = "/tmp/hadoop-3.2.0";

/// Settings for a `dg-mgmt` invocation. Loaded once and passed by reference
/// into every component constructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    pub hadoop_home: PathBuf,
    pub conf_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub remote_shell: String,
    pub host_domain: String,
    pub poll_interval_secs: u64,
    pub max_checks: u32,
    pub command_timeout_secs: u64,
    pub lock_file: Option<PathBuf>,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            hadoop_home: PathBuf::from(DEFAULT_HADOOP_HOME),
            conf_dir: None,
            data_dir: None,
            remote_shell: String::from("pdsh"),
            host_domain: String::from("apt.emulab.net"),
            poll_interval_secs: 30,
            max_checks: 20,
            command_timeout_secs: 600,
            lock_file: None,
        }
    }
}

impl MigrateConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: MigrateConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: MigrateConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    pub fn hdfs_bin(&self) -> PathBuf {
        self.hadoop_home.join("bin/hdfs")
    }

    /// Directory holding the disk-group membership files.
    pub fn conf_dir(&self) -> PathBuf {
        self.conf_dir
            .clone()
            .unwrap_or_else(|| self.hadoop_home.join("etc/hadoop"))
    }

    /// Datanode storage directory on every worker, `/tmp/hadoop-<user>` by default.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            let user = std::env::var("USER")
                .or_else(|_| std::env::var("LOGNAME"))
                .unwrap_or_else(|_| String::from("hadoop"));
            PathBuf::from(format!("/tmp/hadoop-{}", user))
        })
    }

    pub fn lock_file(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.conf_dir().join(crate::registry::LOCK_FILE))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
