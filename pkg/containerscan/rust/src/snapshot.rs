// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! The result of one scan cycle, and the store publishing it to readers.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::ancestry::Owner;
use crate::procfs::ProcessSample;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntry {
    pub sample: ProcessSample,
    pub owner: Owner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerReport {
    #[serde(rename = "PodName")]
    pub pod_name: String,
    #[serde(rename = "ContainerId")]
    pub container_id: String,
    #[serde(rename = "FileList")]
    pub file_list: Vec<String>,
}

/// Wire form of a process entry.
#[derive(Debug, Serialize)]
struct ProcessRecord<'a> {
    #[serde(rename = "ProcessName")]
    process_name: &'a str,
    #[serde(rename = "CpuUsage")]
    cpu_usage: String,
    #[serde(rename = "MemoryUsage")]
    memory_usage: String,
    #[serde(rename = "ProcessId")]
    process_id: String,
    #[serde(rename = "WhoIsParent")]
    who_is_parent: String,
}

impl<'a> From<&'a ProcessEntry> for ProcessRecord<'a> {
    fn from(entry: &'a ProcessEntry) -> Self {
        ProcessRecord {
            process_name: &entry.sample.command_name,
            cpu_usage: format!("{:.3}%", entry.sample.cpu_percent),
            memory_usage: format!("{}MB", entry.sample.resident_memory_bytes / BYTES_PER_MB),
            process_id: entry.sample.pid.to_string(),
            who_is_parent: entry.owner.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SnapshotDocument<'a> {
    processes: Vec<ProcessRecord<'a>>,
    containers: &'a [ContainerReport],
}

/// An immutable scan result. Processes are ordered by descending CPU usage,
/// then descending resident memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    processes: Vec<ProcessEntry>,
    containers: Vec<ContainerReport>,
}

impl Snapshot {
    pub fn new(mut processes: Vec<ProcessEntry>, containers: Vec<ContainerReport>) -> Self {
        processes.sort_by(|a, b| {
            b.sample
                .cpu_percent
                .total_cmp(&a.sample.cpu_percent)
                .then_with(|| {
                    b.sample
                        .resident_memory_bytes
                        .cmp(&a.sample.resident_memory_bytes)
                })
                .then_with(|| a.sample.pid.cmp(&b.sample.pid))
        });
        Self {
            processes,
            containers,
        }
    }

    pub fn processes(&self) -> &[ProcessEntry] {
        &self.processes
    }

    pub fn containers(&self) -> &[ContainerReport] {
        &self.containers
    }

    fn process_records(&self) -> Vec<ProcessRecord<'_>> {
        self.processes.iter().map(ProcessRecord::from).collect()
    }

    /// Pretty-printed JSON array of the process report.
    pub fn process_report_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.process_records())
    }

    /// Pretty-printed JSON array of the container report.
    pub fn container_report_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.containers)
    }

    /// Both reports in one document.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&SnapshotDocument {
            processes: self.process_records(),
            containers: &self.containers,
        })
    }
}

/// Holds the most recently published Snapshot. Readers get a reference to a
/// complete Snapshot and never block the writer for longer than an `Arc`
/// clone.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }
}
