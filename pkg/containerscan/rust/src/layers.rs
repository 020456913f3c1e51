// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Locates the overlay merged (read view) and diff (upper) directories of
//! each container, as seen through the agent's host mount.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Deserialize;

use crate::config::HostPaths;
use crate::errors::ScanError;
use crate::fs::{DocumentError, SubDirFs};
use crate::identity::{
    CRI_CONTAINER_TYPE_ANNOTATION, CRI_SANDBOX_ID_ANNOTATION, MAX_METADATA_FILE_SIZE, OciSpec,
};
use crate::procfs::Procfs;
use crate::runtime::RuntimeKind;

const OVERLAY_FSTYPE: &str = "overlay";
const UPPERDIR_OPTION: &str = "upperdir=";
const ROOTFS_COMPONENT: &str = "rootfs";
const MERGED_COMPONENT: &str = "merged";
const DIFF_COMPONENT: &str = "diff";
const CRI_CONTAINER_TYPE_CONTAINER: &str = "container";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLayerPaths {
    pub container_id: String,
    pub merged_dir: PathBuf,
    pub diff_dir: PathBuf,
}

/// Resolves the layer directories of `container_ids` (as found on the shims'
/// command lines). Unreadable runtime state is fatal to the whole call.
pub fn locate_layers(
    container_ids: &[String],
    runtime: RuntimeKind,
    paths: &HostPaths,
    procfs: &Procfs,
) -> Result<Vec<ContainerLayerPaths>, ScanError> {
    if container_ids.is_empty() {
        return Ok(Vec::new());
    }

    match runtime {
        RuntimeKind::Containerd => locate_containerd_layers(container_ids, paths, procfs),
        RuntimeKind::Docker | RuntimeKind::Crio => {
            let mut seen = HashSet::new();
            let mut layers = Vec::new();
            for id in container_ids.iter().filter(|id| seen.insert(id.as_str())) {
                if let Some(layer) = locate_state_layers(id, runtime, paths)? {
                    layers.push(layer);
                }
            }
            Ok(layers)
        }
    }
}

/// Returns the snapshot key of an overlay mount target: the path component
/// preceding `rootfs`, e.g. `<id>` in
/// `/run/containerd/io.containerd.runtime.v2.task/k8s.io/<id>/rootfs`.
fn snapshot_key(target: &str) -> Option<&str> {
    let components: Vec<&str> = target.split('/').collect();
    components.windows(2).find_map(|pair| match pair {
        [key, ROOTFS_COMPONENT] if !key.is_empty() => Some(*key),
        _ => None,
    })
}

fn rebase_upperdir(upperdir: &str, paths: &HostPaths) -> PathBuf {
    match upperdir.strip_prefix(paths.containerd_snapshotter_host_prefix.as_str()) {
        Some(rest) => paths.containerd_snapshotter_mount.join(rest),
        None => paths.host_root.join(upperdir.trim_start_matches('/')),
    }
}

/// Maps snapshot key -> agent-side upper directory for every overlay mount
/// in a mount table.
fn overlay_upperdirs(mounts: &str, paths: &HostPaths) -> HashMap<String, PathBuf> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let (_source, target, fstype, options) =
                (fields.next()?, fields.next()?, fields.next()?, fields.next()?);
            if fstype != OVERLAY_FSTYPE {
                return None;
            }
            let key = snapshot_key(target)?;
            let upperdir = options
                .split(',')
                .find_map(|option| option.strip_prefix(UPPERDIR_OPTION))?;
            Some((key.to_string(), rebase_upperdir(upperdir, paths)))
        })
        .collect()
}

fn locate_containerd_layers(
    container_ids: &[String],
    paths: &HostPaths,
    procfs: &Procfs,
) -> Result<Vec<ContainerLayerPaths>, ScanError> {
    let upperdirs = overlay_upperdirs(&procfs.init_mounts()?, paths);

    let task_root = &paths.containerd_task_root;
    let task_root_error = |source| ScanError::TaskRoot {
        path: task_root.clone(),
        source,
    };
    let mut task_ids: Vec<String> = fs::read_dir(task_root)
        .map_err(task_root_error)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    task_ids.sort();
    let tasks = SubDirFs::new(task_root).map_err(task_root_error)?;

    let wanted: HashSet<&str> = container_ids.iter().map(String::as_str).collect();
    let mut seen_sandboxes = HashSet::new();
    let mut layers = Vec::new();

    for task_id in task_ids {
        let document = Path::new(&task_id).join("config.json");
        let spec: OciSpec = match tasks.read_document(&document, Some(MAX_METADATA_FILE_SIZE)) {
            Ok(spec) => spec,
            Err(e) => {
                debug!("skipping containerd task {task_id}: {e:?}");
                continue;
            }
        };

        if spec.annotation(CRI_CONTAINER_TYPE_ANNOTATION) != Some(CRI_CONTAINER_TYPE_CONTAINER) {
            continue;
        }
        let Some(sandbox_id) = spec
            .annotation(CRI_SANDBOX_ID_ANNOTATION)
            .filter(|id| !id.is_empty())
        else {
            continue;
        };
        if !wanted.contains(sandbox_id) || seen_sandboxes.contains(sandbox_id) {
            continue;
        }

        let Some(diff_dir) = upperdirs.get(&task_id) else {
            warn!("no overlay mount for container {task_id} (sandbox {sandbox_id}), skipping");
            continue;
        };

        seen_sandboxes.insert(sandbox_id.to_string());
        layers.push(ContainerLayerPaths {
            container_id: sandbox_id.to_string(),
            merged_dir: task_root.join(&task_id).join(ROOTFS_COMPONENT),
            diff_dir: diff_dir.clone(),
        });
    }

    Ok(layers)
}

/// runc's `state.json` as written by Docker.
#[derive(Deserialize, Debug, Default)]
struct RuncState {
    #[serde(default)]
    config: Option<RuncConfig>,
}

#[derive(Deserialize, Debug, Default)]
struct RuncConfig {
    #[serde(default)]
    rootfs: String,
}

/// Returns the metadata root, the state document below it, and the anchor
/// marking where the runtime's storage starts in the host rootfs path.
fn state_location(
    runtime: RuntimeKind,
    paths: &HostPaths,
    container_id: &str,
) -> (PathBuf, PathBuf, &'static str) {
    match runtime {
        RuntimeKind::Crio => (
            paths.crio_storage_root.clone(),
            PathBuf::from("overlay-containers")
                .join(container_id)
                .join("userdata")
                .join("config.json"),
            "/containers/",
        ),
        RuntimeKind::Docker | RuntimeKind::Containerd => (
            paths.docker_state_root.clone(),
            PathBuf::from(container_id).join("state.json"),
            "/docker/",
        ),
    }
}

fn read_rootfs(runtime: RuntimeKind, fs: &SubDirFs, document: &Path) -> Result<String, DocumentError> {
    match runtime {
        RuntimeKind::Crio => {
            let spec: OciSpec = fs.read_document(document, Some(MAX_METADATA_FILE_SIZE))?;
            Ok(spec.root.map(|root| root.path).unwrap_or_default())
        }
        RuntimeKind::Docker | RuntimeKind::Containerd => {
            let state: RuncState = fs.read_document(document, Some(MAX_METADATA_FILE_SIZE))?;
            Ok(state.config.map(|config| config.rootfs).unwrap_or_default())
        }
    }
}

/// Derives the layer directories from the runtime's state document. A rootfs
/// without a `merged` component has no separate diff directory, so that
/// container is skipped.
fn locate_state_layers(
    container_id: &str,
    runtime: RuntimeKind,
    paths: &HostPaths,
) -> Result<Option<ContainerLayerPaths>, ScanError> {
    let (root, document, anchor) = state_location(runtime, paths, container_id);
    let path = root.join(&document);

    let fs = SubDirFs::new(&root).map_err(|source| ScanError::StateDocument {
        path: path.clone(),
        source,
    })?;
    let rootfs = read_rootfs(runtime, &fs, &document).map_err(|e| match e {
        DocumentError::Io(source) => ScanError::StateDocument {
            path: path.clone(),
            source,
        },
        DocumentError::Json(source) => ScanError::StateFormat {
            path: path.clone(),
            source,
        },
    })?;

    // Keep the suffix starting at the anchor and rebase it under the host
    // mount: /var/lib/docker/overlay2/<l>/merged -> <host_root>/docker/overlay2/<l>/merged
    let suffix = rootfs
        .find(anchor)
        .and_then(|start| rootfs.get(start..))
        .ok_or_else(|| ScanError::RootfsLayout {
            path: path.clone(),
            rootfs: rootfs.clone(),
        })?;
    let diff_suffix = suffix.replacen(MERGED_COMPONENT, DIFF_COMPONENT, 1);
    if diff_suffix == suffix {
        warn!("rootfs {rootfs} of container {container_id} has no diff layer, skipping");
        return Ok(None);
    }

    Ok(Some(ContainerLayerPaths {
        container_id: container_id.to_string(),
        merged_dir: paths.host_root.join(suffix.trim_start_matches('/')),
        diff_dir: paths.host_root.join(diff_suffix.trim_start_matches('/')),
    }))
}
