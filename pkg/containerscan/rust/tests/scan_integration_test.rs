// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use dd_containerscan::{
    ContainerReport, HostPaths, Owner, ScanAgent, Scanner, SnapshotStore, SystemUnits,
};
use tempfile::TempDir;

const UNITS: SystemUnits = SystemUnits {
    ticks_per_second: 100.0,
    page_size: 4096,
};

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn symlink(root: &Path, target: &str, rel: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::os::unix::fs::symlink(target, path).unwrap();
}

fn add_process(root: &Path, pid: i32, comm: &str, ppid: i32, utime: u64, rss: u64, args: &[&str]) {
    write(
        root,
        &format!("proc/{pid}/stat"),
        &format!(
            "{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194560 100 0 0 0 \
             {utime} 0 0 0 20 0 1 0 0 123456789 {rss} 18446744073709551615\n"
        ),
    );
    write(root, &format!("proc/{pid}/cmdline"), &format!("{}\0", args.join("\0")));
}

fn conmon(id: &str) -> Vec<String> {
    vec![
        "/usr/bin/conmon".to_string(),
        "-b".to_string(),
        format!("/var/run/containers/storage/overlay-containers/{id}/userdata"),
        "-c".to_string(),
        id.to_string(),
        "-r".to_string(),
        "/usr/bin/runc".to_string(),
        "--log-path".to_string(),
        format!("/var/log/cri-o/{id}.log"),
    ]
}

fn add_crio_container(root: &Path, id: &str, pod_name: &str, layer: &str) {
    write(
        root,
        &format!("containers/storage/overlay-containers/{id}/userdata/config.json"),
        &format!(
            r#"{{
                "root": {{"path": "/var/lib/containers/storage/overlay/{layer}/merged"}},
                "annotations": {{
                    "io.kubernetes.pod.name": "{pod_name}",
                    "io.kubernetes.cri-o.SandboxID": "sandbox-{id}"
                }}
            }}"#
        ),
    );
}

/// A CRI-O node running a database pod and a cache pod. The cache
/// container's filesystem holds a dangling symbolic link.
fn crio_node() -> TempDir {
    let host = TempDir::new().unwrap();
    let root = host.path();

    write(root, "proc/uptime", "1000.00 3000.00\n");
    add_process(root, 1, "systemd", 0, 0, 100, &["/sbin/init"]);
    add_process(
        root,
        800,
        "kubelet",
        1,
        1000,
        25600,
        &[
            "/usr/bin/kubelet",
            "--container-runtime-endpoint",
            "unix:///var/run/crio/crio.sock",
        ],
    );

    let db_shim = conmon("def456");
    let db_shim: Vec<&str> = db_shim.iter().map(String::as_str).collect();
    add_process(root, 200, "conmon", 1, 0, 100, &db_shim);
    add_process(root, 201, "mysqld", 200, 30000, 51200, &["mysqld"]);
    add_process(root, 202, "mysqld-worker", 201, 0, 0, &["mysqld"]);

    let cache_shim = conmon("ghi789");
    let cache_shim: Vec<&str> = cache_shim.iter().map(String::as_str).collect();
    add_process(root, 300, "conmon", 1, 0, 100, &cache_shim);
    add_process(root, 301, "redis-server", 300, 0, 2560, &["redis-server", "*:6379"]);

    add_crio_container(root, "def456", "db-0", "9c1e");
    let db = "containers/storage/overlay/9c1e";
    write(root, &format!("{db}/merged/etc/my.cnf"), "[mysqld]\n");
    write(root, &format!("{db}/merged/usr/lib/libssl.so"), "elf");
    symlink(root, "usr/lib", &format!("{db}/merged/lib"));
    write(root, &format!("{db}/diff/etc/my.cnf"), "[mysqld]\n");
    write(root, &format!("{db}/diff/etc/new.cnf"), "");

    add_crio_container(root, "ghi789", "cache-0", "77aa");
    let cache = "containers/storage/overlay/77aa";
    write(root, &format!("{cache}/merged/data/dump.rdb"), "");
    symlink(root, "/data/missing.rdb", &format!("{cache}/merged/data/latest.rdb"));
    write(root, &format!("{cache}/diff/data/dump.rdb"), "");

    host
}

#[test]
fn test_crio_node_scan() {
    let host = crio_node();
    let snapshot = Scanner::with_units(HostPaths::under(host.path()), UNITS)
        .scan()
        .unwrap();

    let processes: Vec<(i32, String)> = snapshot
        .processes()
        .iter()
        .map(|p| (p.sample.pid, p.owner.to_string()))
        .collect();
    assert_eq!(
        processes,
        vec![
            (201, "db-0/def456".to_string()),
            (800, "Host".to_string()),
            (301, "cache-0/ghi789".to_string()),
            (1, "Host".to_string()),
            (200, "db-0/def456".to_string()),
            (300, "cache-0/ghi789".to_string()),
            (202, "db-0/def456".to_string()),
        ]
    );

    // The cache container's walk fails on its dangling link and is left out
    assert_eq!(
        snapshot.containers(),
        &[ContainerReport {
            pod_name: "db-0".to_string(),
            container_id: "def456".to_string(),
            file_list: [
                "/etc/ MODIFIED",
                "/etc/my.cnf MODIFIED",
                "/usr/lib/",
                "/usr/lib/libssl.so",
                "/usr/",
                "/usr/lib/",
                "/usr/lib/libssl.so",
            ]
            .iter()
            .map(|entry| entry.to_string())
            .collect(),
        }]
    );
}

#[test]
fn test_missing_identity_attributes_container_to_host() {
    let host = crio_node();
    fs::remove_file(
        host.path()
            .join("containers/storage/overlay-containers/def456/userdata/config.json"),
    )
    .unwrap();
    fs::remove_file(host.path().join("containers/storage/overlay/77aa/merged/data/latest.rdb"))
        .unwrap();

    let snapshot = Scanner::with_units(HostPaths::under(host.path()), UNITS)
        .scan()
        .unwrap();
    for process in snapshot.processes() {
        let expected = matches!(process.sample.pid, 300 | 301);
        assert_eq!(
            process.owner != Owner::Host,
            expected,
            "pid {}",
            process.sample.pid
        );
    }

    let containers: Vec<&str> = snapshot
        .containers()
        .iter()
        .map(|c| c.container_id.as_str())
        .collect();
    assert_eq!(containers, vec!["ghi789"]);
    assert_eq!(
        snapshot.containers()[0].file_list,
        vec!["/data/ MODIFIED", "/data/dump.rdb MODIFIED"]
    );
}

#[test]
fn test_agent_keeps_last_good_snapshot() {
    let host = crio_node();
    let store = Arc::new(SnapshotStore::new());
    let agent = ScanAgent::new(
        Scanner::with_units(HostPaths::under(host.path()), UNITS),
        Arc::clone(&store),
    );

    agent.run_cycle();
    let first = store.current();
    assert_eq!(first.processes().len(), 7);
    assert_eq!(first.containers().len(), 1);

    // An unrecognized root filesystem layout fails the whole cycle
    fs::write(
        host.path()
            .join("containers/storage/overlay-containers/def456/userdata/config.json"),
        r#"{"root": {"path": "/mnt/elsewhere/merged"}, "annotations": {"io.kubernetes.pod.name": "db-0"}}"#,
    )
    .unwrap();
    agent.run_cycle();
    assert!(Arc::ptr_eq(&first, &store.current()));

    let json = store.current().process_report_json().unwrap();
    let report: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(report[0]["ProcessName"], "mysqld");
    assert_eq!(report[0]["CpuUsage"], "30.000%");
    assert_eq!(report[0]["MemoryUsage"], "200MB");
}
