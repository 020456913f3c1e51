// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::fmt;

use log::debug;
use serde::Serialize;

use crate::procfs::{Cmdline, Procfs};

const RUNTIME_ENDPOINT_OPTION: &str = "container-runtime-endpoint";

/// The container runtimes the agent knows how to introspect. Everything that
/// differs between them (shim detection, metadata locations, layer lookup)
/// hangs off this enum.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Containerd,
    Crio,
}

impl RuntimeKind {
    /// Substring of the shim command line marking it as this runtime's shim.
    /// Docker nodes run their containers under containerd shims too.
    pub fn shim_marker(self) -> &'static str {
        match self {
            RuntimeKind::Docker | RuntimeKind::Containerd => "containerd-shim",
            RuntimeKind::Crio => "cri-o",
        }
    }

    /// Shim argument preceding the container id.
    pub fn id_flag(self) -> &'static str {
        match self {
            RuntimeKind::Docker | RuntimeKind::Containerd => "-id",
            RuntimeKind::Crio => "-c",
        }
    }

    /// Detects the runtime from the value of the kubelet's
    /// `--container-runtime-endpoint` option. The order matters: the first
    /// matching marker wins.
    fn from_endpoint(endpoint: &str) -> Option<Self> {
        const ENDPOINT_MARKERS: [(&str, RuntimeKind); 2] = [
            ("crio", RuntimeKind::Crio),
            ("containerd", RuntimeKind::Containerd),
        ];

        ENDPOINT_MARKERS
            .iter()
            .find(|(marker, _)| endpoint.contains(marker))
            .map(|(_, kind)| *kind)
    }

    pub fn from_kubelet_cmdline(cmdline: &Cmdline) -> Self {
        cmdline
            .option_value(RUNTIME_ENDPOINT_OPTION)
            .and_then(Self::from_endpoint)
            .unwrap_or_default()
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Containerd => write!(f, "containerd"),
            RuntimeKind::Crio => write!(f, "crio"),
        }
    }
}

/// Determines the active runtime from the kubelet's command line. A node
/// without a visible kubelet, or a kubelet without a recognizable endpoint,
/// is assumed to run Docker.
pub fn detect_runtime(procfs: &Procfs, kubelet_pid: Option<i32>) -> RuntimeKind {
    let Some(pid) = kubelet_pid else {
        debug!("no kubelet process found, assuming {}", RuntimeKind::default());
        return RuntimeKind::default();
    };

    match procfs.cmdline(pid) {
        Ok(cmdline) => RuntimeKind::from_kubelet_cmdline(&cmdline),
        Err(e) => {
            debug!("could not read kubelet cmdline (pid {pid}): {e}");
            RuntimeKind::default()
        }
    }
}
