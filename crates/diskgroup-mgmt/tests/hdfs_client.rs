//! Migration through the real HDFS client with stub `hdfs` and `pdsh` binaries.

mod common;

use common::{two_group_cluster, G6, G7};
use diskgroup_mgmt::report::render_record;
use diskgroup_mgmt::{
    CommitStep, DecommissionMonitor, HdfsAdminClient, MigrationOrchestrator, OrchestratorError,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// `hdfs` stub: `dfsadmin -report` prints the canned report, anything else succeeds.
fn stub_hdfs(dir: &Path, report: &Path) -> PathBuf {
    write_script(
        dir,
        "hdfs",
        &format!(
            "if [ \"$2\" = \"-report\" ]; then cat {}; fi\nexit 0\n",
            report.display()
        ),
    )
}

/// `pdsh` stub that logs its arguments. Stopping a daemon fails remotely; like
/// the real tool it only exits non-zero when given `-S`.
fn stub_pdsh(dir: &Path, log: &Path) -> PathBuf {
    write_script(
        dir,
        "pdsh",
        &format!(
            "echo \"$@\" >> {log}\n\
             case \"$*\" in\n\
             *\"--daemon stop\"*)\n\
             echo \"node3: ssh exited with exit code 1\" >&2\n\
             [ \"$1\" = \"-S\" ] && exit 1\n\
             exit 0 ;;\n\
             esac\n\
             exit 0\n",
            log = log.display()
        ),
    )
}

#[tokio::test]
async fn test_failed_remote_stop_is_not_followed_by_wipe() {
    let (_conf, registry, _all) = two_group_cluster();
    let bin = TempDir::new().unwrap();
    let report = bin.path().join("report.txt");
    std::fs::write(&report, render_record("10.1.0.3", "node3", "Decommissioned")).unwrap();
    let log = bin.path().join("pdsh.log");

    let admin = HdfsAdminClient::new(
        stub_hdfs(bin.path(), &report),
        stub_pdsh(bin.path(), &log).to_string_lossy(),
        "/tmp/hadoop-x",
        Duration::from_secs(10),
    );
    let orch = MigrationOrchestrator::new(
        registry.clone(),
        Arc::new(admin),
        DecommissionMonitor::new(Duration::from_millis(1), 3),
    );

    let err = orch
        .migrate_one("node3", G6, G7, &CancellationToken::new())
        .await
        .unwrap_err();

    let OrchestratorError::PartialCommitFailure {
        failed_hosts,
        migrated,
    } = err
    else {
        panic!("expected PartialCommitFailure");
    };
    assert!(migrated.is_empty());
    assert_eq!(failed_hosts["node3"].step, CommitStep::StopDaemon);

    let calls = std::fs::read_to_string(&log).unwrap();
    assert!(calls.contains("--daemon stop datanode"));
    assert!(!calls.contains("rm -rf"), "wiped after a failed stop: {}", calls);
    assert!(!calls.contains("--daemon start"));
    assert!(!registry.is_member("node3", G7).unwrap());
}
