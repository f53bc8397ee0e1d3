use crate::topology::{ClusterConfig, ClusterTopology, ConfigError, DiskGroup, EcPolicy};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const WORKERS_FILE: &str = "workers";
pub const LOCK_FILE: &str = ".dg-mgmt.lock";
const GROUP_SUFFIX: &str = ".txt";
const EXCLUDES_SUFFIX: &str = "-excludes.txt";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown disk group: {0}")]
    UnknownGroup(String),
    #[error("{host} is already a member of disk group {group}")]
    AlreadyMember { host: String, group: String },
    #[error("Disk group {group} would drop to {remaining} members, policy needs {required}")]
    BelowPolicyMinimum {
        group: String,
        remaining: usize,
        required: usize,
    },
    #[error("Need {needed} worker nodes, only {available} discovered")]
    NotEnoughWorkers { needed: usize, available: usize },
    #[error("Cluster lock {0} is held by another migration")]
    Locked(PathBuf),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> RegistryError + '_ {
    move |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads a one-hostname-per-line file, skipping blanks and repeated names.
fn read_hosts(path: &Path) -> io::Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    let mut seen = BTreeSet::new();
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect())
}

/// Replaces `path` with the given hosts. Readers see either the old or the
/// new file, never a partial one, and the rename is on disk before returning.
fn write_hosts<'a>(path: &Path, hosts: impl IntoIterator<Item = &'a str>) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut tmp_file = File::create(&tmp_path)?;
        for host in hosts {
            writeln!(tmp_file, "{}", host)?;
        }
        tmp_file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

/// Exclusive advisory lock serializing migrations against one cluster.
/// Released when dropped.
#[derive(Debug)]
pub struct ClusterLock {
    file: File,
    path: PathBuf,
}

impl ClusterLock {
    pub fn acquire(path: &Path) -> Result<Self, RegistryError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err(path))?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(RegistryError::Locked(path.to_path_buf()));
            }
            return Err(RegistryError::Io {
                path: path.to_path_buf(),
                source: err,
            });
        }

        tracing::debug!("Acquired cluster lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        // SAFETY: `self.file` is still open; closing it would release the lock anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!("Released cluster lock {}", self.path.display());
    }
}

/// File-backed disk-group membership.
///
/// Layout under the config directory:
/// - `<group>.txt`: current members of the group
/// - `<group>-excludes.txt`: hosts being decommissioned from the group
/// - `workers`: every non-control node
///
/// Nothing is cached; each call reads the persisted files and each mutation
/// is written through before returning.
#[derive(Debug, Clone)]
pub struct DiskGroupRegistry {
    conf_dir: PathBuf,
    lock_file: PathBuf,
}

impl DiskGroupRegistry {
    pub fn open(conf_dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let conf_dir = conf_dir.into();
        let meta = fs::metadata(&conf_dir).map_err(io_err(&conf_dir))?;
        if !meta.is_dir() {
            return Err(RegistryError::Io {
                path: conf_dir,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            });
        }
        Ok(Self::at(conf_dir))
    }

    pub fn create(conf_dir: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let conf_dir = conf_dir.into();
        fs::create_dir_all(&conf_dir).map_err(io_err(&conf_dir))?;
        Ok(Self::at(conf_dir))
    }

    fn at(conf_dir: PathBuf) -> Self {
        let lock_file = conf_dir.join(LOCK_FILE);
        Self {
            conf_dir,
            lock_file,
        }
    }

    /// Uses `path` instead of `<conf_dir>/.dg-mgmt.lock` for [`Self::lock`].
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = path.into();
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_file
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    pub fn group_path(&self, group: &str) -> PathBuf {
        self.conf_dir.join(format!("{}{}", group, GROUP_SUFFIX))
    }

    pub fn excludes_path(&self, group: &str) -> PathBuf {
        self.conf_dir.join(format!("{}{}", group, EXCLUDES_SUFFIX))
    }

    pub fn workers_path(&self) -> PathBuf {
        self.conf_dir.join(WORKERS_FILE)
    }

    /// Takes the cluster lock. Every writer of the membership files goes
    /// through here.
    pub fn lock(&self) -> Result<ClusterLock, RegistryError> {
        ClusterLock::acquire(&self.lock_file)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.group_path(group).is_file()
    }

    /// Group names, sorted.
    pub fn groups(&self) -> Result<Vec<String>, RegistryError> {
        let entries = fs::read_dir(&self.conf_dir).map_err(io_err(&self.conf_dir))?;
        let mut groups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&self.conf_dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(EXCLUDES_SUFFIX) {
                continue;
            }
            if let Some(group) = name.strip_suffix(GROUP_SUFFIX) {
                if !group.is_empty() && entry.path().is_file() {
                    groups.push(group.to_string());
                }
            }
        }
        groups.sort();
        Ok(groups)
    }

    pub fn members(&self, group: &str) -> Result<Vec<String>, RegistryError> {
        let path = self.group_path(group);
        match read_hosts(&path) {
            Ok(hosts) => Ok(hosts),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RegistryError::UnknownGroup(group.to_string()))
            }
            Err(source) => Err(RegistryError::Io { path, source }),
        }
    }

    /// A group without an excludes file has nothing excluded.
    pub fn excludes(&self, group: &str) -> Result<BTreeSet<String>, RegistryError> {
        if !self.has_group(group) {
            return Err(RegistryError::UnknownGroup(group.to_string()));
        }
        let path = self.excludes_path(group);
        match read_hosts(&path) {
            Ok(hosts) => Ok(hosts.into_iter().collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(source) => Err(RegistryError::Io { path, source }),
        }
    }

    pub fn workers(&self) -> Result<Vec<String>, RegistryError> {
        let path = self.workers_path();
        read_hosts(&path).map_err(io_err(&path))
    }

    pub fn is_member(&self, host: &str, group: &str) -> Result<bool, RegistryError> {
        match self.members(group) {
            Ok(members) => Ok(members.iter().any(|m| m == host)),
            Err(RegistryError::UnknownGroup(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The group currently holding `host`, if any.
    pub fn group_of(&self, host: &str) -> Result<Option<String>, RegistryError> {
        for group in self.groups()? {
            if self.is_member(host, &group)? {
                return Ok(Some(group));
            }
        }
        Ok(None)
    }

    pub fn add_exclude(&self, host: &str, group: &str) -> Result<(), RegistryError> {
        let mut excludes = self.excludes(group)?;
        if excludes.insert(host.to_string()) {
            let path = self.excludes_path(group);
            write_hosts(&path, excludes.iter().map(String::as_str)).map_err(io_err(&path))?;
            tracing::info!("Excluded {} from {}", host, group);
        }
        Ok(())
    }

    pub fn remove_exclude(&self, host: &str, group: &str) -> Result<(), RegistryError> {
        let mut excludes = self.excludes(group)?;
        if excludes.remove(host) {
            let path = self.excludes_path(group);
            write_hosts(&path, excludes.iter().map(String::as_str)).map_err(io_err(&path))?;
            tracing::info!("Removed {} from {} excludes", host, group);
        }
        Ok(())
    }

    /// Idempotent. Refuses to take the group below its policy minimum.
    pub fn remove_member(&self, host: &str, group: &str) -> Result<(), RegistryError> {
        let members = self.members(group)?;
        if !members.iter().any(|m| m == host) {
            return Ok(());
        }

        let policy = EcPolicy::parse(group)?;
        let remaining = members.len() - 1;
        if remaining < policy.min_nodes() {
            return Err(RegistryError::BelowPolicyMinimum {
                group: group.to_string(),
                remaining,
                required: policy.min_nodes(),
            });
        }

        let path = self.group_path(group);
        write_hosts(&path, members.iter().map(String::as_str).filter(|m| *m != host))
            .map_err(io_err(&path))?;
        tracing::info!("Removed {} from disk group {}", host, group);
        Ok(())
    }

    /// Idempotent for the same group; fails if `host` belongs to any other group.
    pub fn add_member(&self, host: &str, group: &str) -> Result<(), RegistryError> {
        let mut members = self.members(group)?;
        if members.iter().any(|m| m == host) {
            return Ok(());
        }
        if let Some(owner) = self.group_of(host)? {
            return Err(RegistryError::AlreadyMember {
                host: host.to_string(),
                group: owner,
            });
        }

        members.push(host.to_string());
        let path = self.group_path(group);
        write_hosts(&path, members.iter().map(String::as_str)).map_err(io_err(&path))?;
        tracing::info!("Added {} to disk group {}", host, group);
        Ok(())
    }

    /// Parses and validates a cluster config, then attaches the persisted
    /// membership of every configured group.
    pub fn load_topology(&self, config_source: &Path) -> Result<ClusterTopology, ConfigError> {
        let config = ClusterConfig::from_file(config_source)?;
        self.topology_for(&config)
    }

    pub fn topology_for(&self, config: &ClusterConfig) -> Result<ClusterTopology, ConfigError> {
        let policies = config.validate()?;
        let mut groups = BTreeMap::new();

        for (name, policy) in policies {
            let mut group = DiskGroup::new(name.clone(), policy);
            group.members = self.read_optional(&self.group_path(&name))?;
            group.excluded = self
                .read_optional(&self.excludes_path(&name))?
                .into_iter()
                .collect();
            groups.insert(name, group);
        }

        Ok(ClusterTopology {
            total_nodes: config.total_num_nodes,
            groups,
        })
    }

    fn read_optional(&self, path: &Path) -> Result<Vec<String>, ConfigError> {
        match read_hosts(path) {
            Ok(hosts) => Ok(hosts),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Writes the initial membership for a freshly discovered cluster.
    ///
    /// Workers are handed out to groups in config order. Existing excludes
    /// files are left untouched.
    pub fn provision(
        &self,
        config: &ClusterConfig,
        workers: &[String],
    ) -> Result<ClusterTopology, RegistryError> {
        config.validate()?;
        let needed = config.assigned_nodes();
        if workers.len() < needed {
            return Err(RegistryError::NotEnoughWorkers {
                needed,
                available: workers.len(),
            });
        }

        let workers_path = self.workers_path();
        write_hosts(&workers_path, workers.iter().map(String::as_str))
            .map_err(io_err(&workers_path))?;
        tracing::info!("Wrote {} workers to {}", workers.len(), workers_path.display());

        let mut next = 0;
        for group in &config.disk_groups {
            let excludes_path = self.excludes_path(&group.ec_policy);
            if !excludes_path.exists() {
                write_hosts(&excludes_path, std::iter::empty()).map_err(io_err(&excludes_path))?;
            }

            let slice = &workers[next..next + group.num_nodes];
            let group_path = self.group_path(&group.ec_policy);
            write_hosts(&group_path, slice.iter().map(String::as_str))
                .map_err(io_err(&group_path))?;
            tracing::info!(
                "Disk group {}: {} nodes ({} .. {})",
                group.ec_policy,
                slice.len(),
                slice.first().map(String::as_str).unwrap_or("-"),
                slice.last().map(String::as_str).unwrap_or("-")
            );
            next += group.num_nodes;
        }

        Ok(self.topology_for(config)?)
    }
}
