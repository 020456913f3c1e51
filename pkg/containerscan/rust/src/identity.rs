// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Pod identity of a container, read from the runtime's on-disk metadata.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::config::HostPaths;
use crate::fs::{DocumentError, SubDirFs};
use crate::runtime::RuntimeKind;

/// Runtime metadata documents embed the full OCI spec and can get large.
pub(crate) const MAX_METADATA_FILE_SIZE: u64 = 8 * 1024 * 1024;

const POD_NAME_KEY: &str = "io.kubernetes.pod.name";
const DOCKER_SANDBOX_ID_LABEL: &str = "io.kubernetes.sandbox.id";
const CRI_SANDBOX_NAME_ANNOTATION: &str = "io.kubernetes.cri.sandbox-name";
pub(crate) const CRI_SANDBOX_ID_ANNOTATION: &str = "io.kubernetes.cri.sandbox-id";
pub(crate) const CRI_CONTAINER_TYPE_ANNOTATION: &str = "io.kubernetes.cri.container-type";
const CRIO_SANDBOX_ID_ANNOTATION: &str = "io.kubernetes.cri-o.SandboxID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodIdentity {
    pub pod_name: String,
    pub sandbox_id: Option<String>,
}

/// Docker's `config.v2.json`.
#[derive(Deserialize, Debug, Default)]
struct DockerContainer {
    #[serde(rename = "Config", default)]
    config: Option<DockerContainerConfig>,
}

#[derive(Deserialize, Debug, Default)]
struct DockerContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

impl DockerContainer {
    fn label(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()?
            .labels
            .as_ref()?
            .get(key)
            .map(String::as_str)
    }
}

/// The OCI runtime spec (`config.json`) written by containerd and CRI-O.
/// Only the fields the agent reads are declared.
#[derive(Deserialize, Debug, Default)]
pub(crate) struct OciSpec {
    #[serde(default)]
    annotations: Option<HashMap<String, String>>,
    #[serde(default)]
    pub(crate) root: Option<OciRoot>,
}

#[derive(Deserialize, Debug, Default)]
pub(crate) struct OciRoot {
    #[serde(default)]
    pub(crate) path: String,
}

impl OciSpec {
    pub(crate) fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }
}

/// Returns the directory holding the runtime's metadata and the path of the
/// container's metadata document below it.
fn metadata_location(
    runtime: RuntimeKind,
    paths: &HostPaths,
    container_id: &str,
) -> (PathBuf, PathBuf) {
    match runtime {
        RuntimeKind::Docker => (
            paths.docker_data_root.clone(),
            PathBuf::from("containers")
                .join(container_id)
                .join("config.v2.json"),
        ),
        RuntimeKind::Containerd => (
            paths.containerd_task_root.clone(),
            PathBuf::from(container_id).join("config.json"),
        ),
        RuntimeKind::Crio => (
            paths.crio_storage_root.clone(),
            PathBuf::from("overlay-containers")
                .join(container_id)
                .join("userdata")
                .join("config.json"),
        ),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn read_identity(
    fs: &SubDirFs,
    runtime: RuntimeKind,
    document: &Path,
) -> Result<Option<PodIdentity>, DocumentError> {
    let (pod_name, sandbox_id) = match runtime {
        RuntimeKind::Docker => {
            let container: DockerContainer =
                fs.read_document(document, Some(MAX_METADATA_FILE_SIZE))?;
            (
                non_empty(container.label(POD_NAME_KEY)),
                non_empty(container.label(DOCKER_SANDBOX_ID_LABEL)),
            )
        }
        RuntimeKind::Containerd => {
            let spec: OciSpec = fs.read_document(document, Some(MAX_METADATA_FILE_SIZE))?;
            (
                non_empty(spec.annotation(CRI_SANDBOX_NAME_ANNOTATION)),
                non_empty(spec.annotation(CRI_SANDBOX_ID_ANNOTATION)),
            )
        }
        RuntimeKind::Crio => {
            let spec: OciSpec = fs.read_document(document, Some(MAX_METADATA_FILE_SIZE))?;
            (
                non_empty(spec.annotation(POD_NAME_KEY)),
                non_empty(spec.annotation(CRIO_SANDBOX_ID_ANNOTATION)),
            )
        }
    };

    Ok(pod_name.map(|pod_name| PodIdentity {
        pod_name,
        sandbox_id,
    }))
}

/// Loads the pod identity of a container. Any failure (missing document,
/// parse error, no pod name) yields `None` and the container's processes are
/// then attributed to the host.
pub fn load_identity(
    container_id: &str,
    runtime: RuntimeKind,
    paths: &HostPaths,
) -> Option<PodIdentity> {
    if container_id.is_empty() {
        return None;
    }

    let (root, document) = metadata_location(runtime, paths, container_id);
    let fs = match SubDirFs::new(&root) {
        Ok(fs) => fs,
        Err(e) => {
            debug!("{runtime} metadata root {} unavailable: {e}", root.display());
            return None;
        }
    };

    match read_identity(&fs, runtime, &document) {
        Ok(Some(identity)) => Some(identity),
        Ok(None) => {
            debug!("container {container_id} has no pod name in {}", document.display());
            None
        }
        Err(e) => {
            debug!(
                "could not load {runtime} metadata {}/{}: {e:?}",
                root.display(),
                document.display()
            );
            None
        }
    }
}
