// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("could not read uptime from {path}: {source}")]
    Uptime { path: PathBuf, source: io::Error },

    #[error("could not parse uptime: {content:?}")]
    UptimeFormat { content: String },

    #[error("could not list processes under {path}: {source}")]
    ProcRoot { path: PathBuf, source: io::Error },

    #[error("could not read mount table {path}: {source}")]
    MountTable { path: PathBuf, source: io::Error },

    #[error("could not list container metadata under {path}: {source}")]
    TaskRoot { path: PathBuf, source: io::Error },

    #[error("could not read state document {path}: {source}")]
    StateDocument { path: PathBuf, source: io::Error },

    #[error("could not parse state document {path}: {source}")]
    StateFormat {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("unexpected root filesystem layout in {path}: {rootfs:?}")]
    RootfsLayout { path: PathBuf, rootfs: String },

    #[error("could not read directory {path}: {source}")]
    WalkRoot { path: PathBuf, source: io::Error },

    #[error("could not resolve symbolic link {path}: {source}")]
    SymlinkTarget { path: PathBuf, source: io::Error },

    #[error("could not read image store {path}: {source}")]
    ImageStore { path: PathBuf, source: io::Error },
}
