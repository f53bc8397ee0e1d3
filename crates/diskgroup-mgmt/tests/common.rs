//! Shared fixtures for migration integration tests.

use async_trait::async_trait;
use diskgroup_mgmt::report::render_record;
use diskgroup_mgmt::{AdminClient, AdminError, ClusterReport, DiskGroupRegistry};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

pub const G6: &str = "RS-6-3-1024k";
pub const G7: &str = "RS-7-3-1024k";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Stop,
    Start,
    Wipe,
}

#[derive(Default)]
struct PlaneState {
    /// host -> reports fetched since it was excluded
    decommissioning: HashMap<String, u32>,
    running: BTreeSet<String>,
    vanished: BTreeSet<String>,
    failures: HashMap<(String, Op), bool>,
    calls: Vec<String>,
}

/// In-memory control plane. Like the real one it learns about excludes by
/// re-reading the exclude files on refresh.
pub struct FakeControlPlane {
    registry: DiskGroupRegistry,
    hosts: Vec<String>,
    polls_to_decommission: Option<u32>,
    state: Mutex<PlaneState>,
}

impl FakeControlPlane {
    /// `polls_to_decommission = None` means excluded nodes never finish.
    pub fn new(
        registry: DiskGroupRegistry,
        hosts: Vec<String>,
        polls_to_decommission: Option<u32>,
    ) -> Self {
        let state = PlaneState {
            running: hosts.iter().cloned().collect(),
            ..PlaneState::default()
        };
        Self {
            registry,
            hosts,
            polls_to_decommission,
            state: Mutex::new(state),
        }
    }

    /// Makes `op` on `host` fail; `unreachable` picks the error kind.
    pub fn fail(&self, host: &str, op: Op, unreachable: bool) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((host.to_string(), op), unreachable);
    }

    pub fn vanish(&self, host: &str) {
        self.state.lock().unwrap().vanished.insert(host.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn is_running(&self, host: &str) -> bool {
        self.state.lock().unwrap().running.contains(host)
    }

    fn check(&self, state: &mut PlaneState, host: &str, op: Op) -> Result<(), AdminError> {
        state.calls.push(format!("{:?} {}", op, host).to_lowercase());
        match state.failures.get(&(host.to_string(), op)) {
            Some(true) => Err(AdminError::Unreachable {
                host: host.to_string(),
                detail: "ssh exited with exit code 255".into(),
            }),
            Some(false) => Err(AdminError::NonZeroExit {
                host: host.to_string(),
                command: format!("{:?}", op),
                code: Some(1),
                stderr: "injected failure".into(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AdminClient for FakeControlPlane {
    async fn apply_excludes(&self) -> Result<(), AdminError> {
        let mut excluded = BTreeSet::new();
        for group in self.registry.groups().expect("list groups") {
            excluded.extend(self.registry.excludes(&group).expect("read excludes"));
        }

        let mut state = self.state.lock().unwrap();
        state.calls.push("refresh".into());
        state.decommissioning.retain(|h, _| excluded.contains(h));
        for host in excluded {
            state.decommissioning.entry(host).or_insert(0);
        }
        Ok(())
    }

    async fn fetch_report(&self) -> Result<ClusterReport, AdminError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("report".into());
        for polls in state.decommissioning.values_mut() {
            *polls += 1;
        }

        let mut text = String::from("Live datanodes:\n\n");
        for (i, host) in self.hosts.iter().enumerate() {
            if state.vanished.contains(host) {
                continue;
            }
            let status = match (state.decommissioning.get(host), self.polls_to_decommission) {
                (Some(polls), Some(needed)) if *polls >= needed => "Decommissioned",
                (Some(_), _) => "Decommission in progress",
                (None, _) => "Normal",
            };
            text.push_str(&render_record(&format!("10.1.0.{}", i), host, status));
            text.push_str("\n\n\n");
        }
        Ok(ClusterReport::parse(&text))
    }

    async fn stop_daemon(&self, host: &str) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        self.check(&mut state, host, Op::Stop)?;
        state.running.remove(host);
        Ok(())
    }

    async fn start_daemon(&self, host: &str) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        self.check(&mut state, host, Op::Start)?;
        state.running.insert(host.to_string());
        Ok(())
    }

    async fn wipe_local_data(&self, host: &str) -> Result<(), AdminError> {
        let mut state = self.state.lock().unwrap();
        assert!(
            !state.running.contains(host),
            "wiped {} while its daemon was running",
            host
        );
        self.check(&mut state, host, Op::Wipe)
    }
}

pub fn hosts(prefix: &str, range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|i| format!("{}{}", prefix, i)).collect()
}

fn write_lines(path: &Path, lines: &[String]) {
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    std::fs::write(path, text).unwrap();
}

/// Two groups: G6 with node1..node11, G7 with node12..node20 (one short of
/// its policy until something migrates in).
pub fn two_group_cluster() -> (TempDir, DiskGroupRegistry, Vec<String>) {
    let dir = TempDir::new().unwrap();
    let registry = DiskGroupRegistry::open(dir.path()).unwrap();
    let g6 = hosts("node", 1..=11);
    let g7 = hosts("node", 12..=20);
    write_lines(&registry.group_path(G6), &g6);
    write_lines(&registry.group_path(G7), &g7);
    write_lines(&registry.excludes_path(G6), &[]);
    write_lines(&registry.excludes_path(G7), &[]);

    let all: Vec<String> = g6.into_iter().chain(g7).collect();
    write_lines(&registry.workers_path(), &all);
    (dir, registry, all)
}

/// Contents of every file in the config directory, for before/after checks.
pub fn snapshot(dir: &Path) -> BTreeMap<String, String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.path().is_file())
        .map(|e| {
            (
                e.file_name().to_string_lossy().into_owned(),
                std::fs::read_to_string(e.path()).unwrap(),
            )
        })
        .collect()
}
