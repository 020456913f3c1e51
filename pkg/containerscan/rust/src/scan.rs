// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, trace, warn};

use crate::ancestry::{Owner, PidAncestry, distinct_containers, resolve_ownership};
use crate::config::HostPaths;
use crate::errors::ScanError;
use crate::identity::load_identity;
use crate::layers::{ContainerLayerPaths, locate_layers};
use crate::procfs::{Procfs, SystemUnits};
use crate::report::mark_modified;
use crate::runtime::detect_runtime;
use crate::snapshot::{ContainerReport, ProcessEntry, Snapshot, SnapshotStore};
use crate::walker::{MAX_WALK_DEPTH, walk};

/// Runs the scan pipeline against one host: process accounting, container
/// attribution, and the per-container filesystem change report.
#[derive(Debug, Clone)]
pub struct Scanner {
    paths: HostPaths,
    procfs: Procfs,
    units: SystemUnits,
}

impl Scanner {
    pub fn new(paths: HostPaths) -> Self {
        Self::with_units(paths, SystemUnits::detect())
    }

    pub fn with_units(paths: HostPaths, units: SystemUnits) -> Self {
        let procfs = Procfs::new(&paths.proc_root);
        Self {
            paths,
            procfs,
            units,
        }
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    /// Runs one complete scan. Errors reading the process table or the
    /// runtime's layer state abort the scan; a container whose filesystem
    /// cannot be walked is left out of the report.
    pub fn scan(&self) -> Result<Snapshot, ScanError> {
        let uptime = self.procfs.read_uptime()?;
        let pids = self.procfs.list_pids()?;
        let table = self.procfs.sample_processes(&pids, uptime, &self.units);

        let runtime = detect_runtime(&self.procfs, table.kubelet_pid);
        debug!("container runtime: {runtime}");

        let ancestry = PidAncestry::build(&self.procfs, &pids);
        let ownership = resolve_ownership(
            &ancestry,
            runtime,
            |pid| match self.procfs.cmdline(pid) {
                Ok(cmdline) => Some(cmdline),
                Err(e) => {
                    trace!("could not read cmdline of pid {pid}: {e}");
                    None
                }
            },
            |container_id| load_identity(container_id, runtime, &self.paths),
        );

        let processes: Vec<ProcessEntry> = table
            .samples
            .into_iter()
            .map(|sample| {
                let owner = ownership.get(&sample.pid).cloned().unwrap_or(Owner::Host);
                ProcessEntry { sample, owner }
            })
            .collect();

        let containers = distinct_containers(&ownership);
        let container_ids: Vec<String> = containers.iter().map(|(_, id)| id.clone()).collect();
        let pod_names: HashMap<&str, &str> = containers
            .iter()
            .map(|(pod_name, id)| (id.as_str(), pod_name.as_str()))
            .collect();

        let layers = locate_layers(&container_ids, runtime, &self.paths, &self.procfs)?;
        let reports: Vec<ContainerReport> = layers
            .iter()
            .filter_map(|layer| {
                let pod_name = pod_names.get(layer.container_id.as_str()).copied()?;
                report_container(pod_name, layer)
            })
            .collect();

        Ok(Snapshot::new(processes, reports))
    }
}

/// Walks both layers of a container and marks the merged entries found in
/// the diff layer. Returns `None` if either walk fails.
fn report_container(pod_name: &str, layer: &ContainerLayerPaths) -> Option<ContainerReport> {
    let walk_layer = |dir: &Path| match walk(dir, MAX_WALK_DEPTH) {
        Ok(entries) => Some(entries),
        Err(e) => {
            warn!(
                "skipping container {} of pod {pod_name}: {e}",
                layer.container_id
            );
            None
        }
    };

    let merged = walk_layer(&layer.merged_dir)?;
    let diff = walk_layer(&layer.diff_dir)?;

    Some(ContainerReport {
        pod_name: pod_name.to_string(),
        container_id: layer.container_id.clone(),
        file_list: mark_modified(merged, &diff),
    })
}

/// Owns the scanner and the store it publishes to. Each cycle either
/// publishes a complete new Snapshot or leaves the previous one in place.
pub struct ScanAgent {
    scanner: Scanner,
    store: Arc<SnapshotStore>,
}

impl ScanAgent {
    pub fn new(scanner: Scanner, store: Arc<SnapshotStore>) -> Self {
        Self { scanner, store }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn run_cycle(&self) {
        let start = Instant::now();
        match self.scanner.scan() {
            Ok(snapshot) => {
                info!(
                    "Scan cycle completed in {:?}: {} processes, {} containers",
                    start.elapsed(),
                    snapshot.processes().len(),
                    snapshot.containers().len()
                );
                self.store.publish(snapshot);
            }
            Err(e) => {
                error!("Scan cycle failed, keeping previous snapshot: {e}");
            }
        }
    }
}
