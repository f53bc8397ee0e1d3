//! Parsing of the control plane's datanode report.
//!
//! The report is a sequence of blank-line separated paragraphs. Each datanode
//! is described by one paragraph of exactly [`RECORD_LINES`] `Key: value`
//! lines carrying a `Hostname` key. Summary headers, section titles and
//! separator lines form paragraphs of their own and are skipped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const RECORD_LINES: usize = 18;
pub const HOSTNAME_KEY: &str = "Hostname";
pub const DECOMMISSION_STATUS_KEY: &str = "Decommission Status";
pub const DECOMMISSIONED: &str = "Decommissioned";
pub const DECOMMISSION_IN_PROGRESS: &str = "Decommission in progress";

/// Decommission state of a node as seen in one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Active,
    Excluding,
    Decommissioned,
    Missing,
}

impl NodeStatus {
    pub fn from_decommission_status(value: &str) -> Self {
        match value {
            DECOMMISSIONED => NodeStatus::Decommissioned,
            DECOMMISSION_IN_PROGRESS => NodeStatus::Excluding,
            _ => NodeStatus::Active,
        }
    }

    pub fn is_decommissioned(&self) -> bool {
        matches!(self, NodeStatus::Decommissioned)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Active => "active",
            NodeStatus::Excluding => "excluding",
            NodeStatus::Decommissioned => "decommissioned",
            NodeStatus::Missing => "missing",
        };
        f.pad(s)
    }
}

/// One datanode paragraph, fields kept in report order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    fields: Vec<(String, String)>,
}

impl NodeRecord {
    fn from_lines(lines: &[&str]) -> Option<Self> {
        if lines.len() != RECORD_LINES {
            return None;
        }
        let fields = lines
            .iter()
            .map(|line| {
                let (key, value) = line.split_once(':')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect::<Option<Vec<_>>>()?;

        let record = Self { fields };
        record.get(HOSTNAME_KEY).filter(|h| !h.is_empty())?;
        Some(record)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn hostname(&self) -> &str {
        self.get(HOSTNAME_KEY).unwrap_or_default()
    }

    pub fn decommission_status(&self) -> Option<&str> {
        self.get(DECOMMISSION_STATUS_KEY)
    }

    pub fn status(&self) -> NodeStatus {
        self.decommission_status()
            .map(NodeStatus::from_decommission_status)
            .unwrap_or(NodeStatus::Active)
    }
}

/// Parsed report keyed by hostname. Iteration follows report order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterReport {
    records: Vec<NodeRecord>,
    by_host: HashMap<String, usize>,
}

impl ClusterReport {
    pub fn parse(text: &str) -> Self {
        let mut report = Self::default();
        let mut paragraph: Vec<&str> = Vec::new();

        for line in text.lines().map(str::trim) {
            if line.is_empty() {
                report.take_paragraph(&mut paragraph);
            } else {
                paragraph.push(line);
            }
        }
        report.take_paragraph(&mut paragraph);

        report
    }

    fn take_paragraph(&mut self, paragraph: &mut Vec<&str>) {
        if let Some(record) = NodeRecord::from_lines(paragraph) {
            self.insert(record);
        }
        paragraph.clear();
    }

    /// A later record for the same host replaces the earlier one in place.
    pub fn insert(&mut self, record: NodeRecord) {
        let host = record.hostname().to_string();
        match self.by_host.get(&host) {
            Some(&idx) => self.records[idx] = record,
            None => {
                self.by_host.insert(host, self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, host: &str) -> Option<&NodeRecord> {
        self.by_host.get(host).map(|&idx| &self.records[idx])
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(NodeRecord::hostname)
    }

    pub fn status_of(&self, host: &str) -> NodeStatus {
        self.get(host)
            .map(NodeRecord::status)
            .unwrap_or(NodeStatus::Missing)
    }

    pub fn statuses(&self) -> BTreeMap<String, NodeStatus> {
        self.records
            .iter()
            .map(|r| (r.hostname().to_string(), r.status()))
            .collect()
    }
}

/// Renders one datanode paragraph in the control plane's layout. Used to
/// build synthetic reports.
pub fn render_record(name: &str, hostname: &str, decommission_status: &str) -> String {
    let lines = [
        format!("Name: {}:9866 ({})", name, hostname),
        format!("Hostname: {}", hostname),
        format!("Decommission Status : {}", decommission_status),
        "Configured Capacity: 62725623808 (58.42 GB)".to_string(),
        "DFS Used: 28672 (28 KB)".to_string(),
        "Non DFS Used: 8573341696 (7.98 GB)".to_string(),
        "DFS Remaining: 50935119872 (47.44 GB)".to_string(),
        "DFS Used%: 0.00%".to_string(),
        "DFS Remaining%: 81.20%".to_string(),
        "Configured Cache Capacity: 0 (0 B)".to_string(),
        "Cache Used: 0 (0 B)".to_string(),
        "Cache Remaining: 0 (0 B)".to_string(),
        "Cache Used%: 100.00%".to_string(),
        "Cache Remaining%: 0.00%".to_string(),
        "Xceivers: 1".to_string(),
        "Last contact: Mon Mar 04 12:00:00 MST 2019".to_string(),
        "Last Block Report: Mon Mar 04 11:45:00 MST 2019".to_string(),
        "Num of Blocks: 0".to_string(),
    ];
    lines.join("\n")
}
