use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid erasure-coding policy: {0}")]
    InvalidPolicy(String),
    #[error("Not enough nodes allocated for {group}: {allocated} < {required}")]
    InsufficientNodesForPolicy {
        group: String,
        allocated: usize,
        required: usize,
    },
    #[error("Allocating {assigned} nodes but totalNumNodes is {total}")]
    OverAllocated { assigned: usize, total: usize },
    #[error("Every node other than the control node must be in a disk group: {assigned} of {total} allocated")]
    UnallocatedNodes { assigned: usize, total: usize },
    #[error("Disk group listed twice: {0}")]
    DuplicateGroup(String),
    #[error("{host} is a member of both {first} and {second}")]
    SharedMember {
        host: String,
        first: String,
        second: String,
    },
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed cluster config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Data/parity split of an erasure-coding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EcPolicy {
    pub width: usize,
    pub parity: usize,
}

impl EcPolicy {
    pub fn new(width: usize, parity: usize) -> Self {
        Self { width, parity }
    }

    /// Parses names like `RS-6-3-1024k` or `RS-LEGACY-6-3-1024k`.
    ///
    /// The first two dash-separated tokens made only of digits are the width
    /// and parity; everything else (codec prefix, block-size suffix) is ignored.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        let mut numeric = name
            .split('-')
            .filter(|token| !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
            .map(|token| token.parse::<usize>());

        match (numeric.next(), numeric.next()) {
            (Some(Ok(width)), Some(Ok(parity))) if width > 0 => Ok(Self { width, parity }),
            _ => Err(ConfigError::InvalidPolicy(name.to_string())),
        }
    }

    pub fn min_nodes(&self) -> usize {
        self.width + self.parity
    }
}

impl std::fmt::Display for EcPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.width, self.parity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskGroupSpec {
    pub ec_policy: String,
    pub num_nodes: usize,
}

/// The provisioning input: how many nodes the cluster has and how many each
/// disk group gets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub total_num_nodes: usize,
    pub disk_groups: Vec<DiskGroupSpec>,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn assigned_nodes(&self) -> usize {
        self.disk_groups.iter().map(|g| g.num_nodes).sum()
    }

    /// Checks every group against its policy and the global allocation sum.
    /// Returns the parsed policy of each group in config order.
    pub fn validate(&self) -> Result<Vec<(String, EcPolicy)>, ConfigError> {
        let mut seen = BTreeSet::new();
        let mut policies = Vec::with_capacity(self.disk_groups.len());

        for group in &self.disk_groups {
            let policy = EcPolicy::parse(&group.ec_policy)?;
            if group.num_nodes < policy.min_nodes() {
                return Err(ConfigError::InsufficientNodesForPolicy {
                    group: group.ec_policy.clone(),
                    allocated: group.num_nodes,
                    required: policy.min_nodes(),
                });
            }
            if !seen.insert(group.ec_policy.as_str()) {
                return Err(ConfigError::DuplicateGroup(group.ec_policy.clone()));
            }
            policies.push((group.ec_policy.clone(), policy));
        }

        let assigned = self.assigned_nodes();
        let total = self.total_num_nodes;
        if assigned > total {
            return Err(ConfigError::OverAllocated { assigned, total });
        }
        // One node may be the control node and stay outside every group.
        if assigned != total && assigned + 1 != total {
            return Err(ConfigError::UnallocatedNodes { assigned, total });
        }

        Ok(policies)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskGroup {
    pub name: String,
    pub policy: EcPolicy,
    pub members: Vec<String>,
    pub excluded: BTreeSet<String>,
}

impl DiskGroup {
    pub fn new(name: impl Into<String>, policy: EcPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            members: Vec::new(),
            excluded: BTreeSet::new(),
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.members.iter().any(|m| m == host)
    }

    pub fn satisfies_policy(&self) -> bool {
        self.members.len() >= self.policy.min_nodes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub total_nodes: usize,
    pub groups: BTreeMap<String, DiskGroup>,
}

impl ClusterTopology {
    pub fn group(&self, name: &str) -> Option<&DiskGroup> {
        self.groups.get(name)
    }

    pub fn group_of(&self, host: &str) -> Option<&str> {
        self.groups
            .values()
            .find(|g| g.contains(host))
            .map(|g| g.name.as_str())
    }

    pub fn member_count(&self) -> usize {
        self.groups.values().map(|g| g.members.len()).sum()
    }

    /// Validates the persisted membership rather than the configured counts:
    /// each group meets its policy and no host sits in two groups.
    pub fn validate_membership(&self) -> Result<(), ConfigError> {
        let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
        for group in self.groups.values() {
            if !group.satisfies_policy() {
                return Err(ConfigError::InsufficientNodesForPolicy {
                    group: group.name.clone(),
                    allocated: group.members.len(),
                    required: group.policy.min_nodes(),
                });
            }
            for host in &group.members {
                if let Some(first) = owner.insert(host.as_str(), group.name.as_str()) {
                    return Err(ConfigError::SharedMember {
                        host: host.clone(),
                        first: first.to_string(),
                        second: group.name.clone(),
                    });
                }
            }
        }

        let assigned = self.member_count();
        if assigned > self.total_nodes {
            return Err(ConfigError::OverAllocated {
                assigned,
                total: self.total_nodes,
            });
        }
        Ok(())
    }
}
