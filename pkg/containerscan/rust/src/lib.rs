// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

mod ancestry;
pub mod config;
mod errors;
mod fs;
pub mod image_layers;
mod identity;
mod layers;
mod procfs;
pub mod register;
mod report;
mod runtime;
mod scan;
mod snapshot;
mod walker;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export the public API
pub use ancestry::{Owner, Ownership, PidAncestry, ShimLookup, resolve_ownership, resolve_shim};
pub use config::{AgentConfig, HostPaths};
pub use errors::ScanError;
pub use identity::{PodIdentity, load_identity};
pub use layers::{ContainerLayerPaths, locate_layers};
pub use procfs::{Cmdline, ProcessSample, Procfs, Stat, SystemUnits};
pub use report::{MODIFIED_MARKER, mark_modified};
pub use runtime::{RuntimeKind, detect_runtime};
pub use scan::{ScanAgent, Scanner};
pub use snapshot::{ContainerReport, ProcessEntry, Snapshot, SnapshotStore};
pub use walker::{MAX_WALK_DEPTH, walk};
