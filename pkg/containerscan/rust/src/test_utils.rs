// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! A throwaway host filesystem for tests: procfs, runtime metadata and
//! overlay directories all live below one temporary root.
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use crate::config::HostPaths;
use crate::procfs::Procfs;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// CPU and memory accounting written into a fake stat line, in clock ticks
/// and pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct Usage {
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
    pub rss: u64,
}

pub struct FakeHost {
    temp_dir: TempDir,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn path<P: AsRef<Path>>(&self, rel: P) -> PathBuf {
        self.root().join(rel)
    }

    /// Writes a file, creating its parent directories.
    pub fn write<P: AsRef<Path>>(&self, rel: P, content: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn mkdir<P: AsRef<Path>>(&self, rel: P) {
        fs::create_dir_all(self.path(rel)).unwrap();
    }

    pub fn symlink<P: AsRef<Path>>(&self, target: &str, rel: P) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        std::os::unix::fs::symlink(target, path).unwrap();
    }

    pub fn procfs(&self) -> Procfs {
        Procfs::new(self.path("proc"))
    }

    pub fn paths(&self) -> HostPaths {
        HostPaths::under(self.root())
    }

    pub fn add_process(&self, pid: i32, comm: &str, ppid: i32, args: &[&str]) {
        self.add_process_with_usage(pid, comm, ppid, args, Usage::default());
    }

    pub fn add_process_with_usage(
        &self,
        pid: i32,
        comm: &str,
        ppid: i32,
        args: &[&str],
        usage: Usage,
    ) {
        let Usage {
            utime,
            stime,
            starttime,
            rss,
        } = usage;
        self.write(
            format!("proc/{pid}/stat"),
            &format!(
                "{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194560 100 0 0 0 \
                 {utime} {stime} 0 0 20 0 1 0 {starttime} 123456789 {rss} \
                 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0\n"
            ),
        );
        self.write(format!("proc/{pid}/cmdline"), &format!("{}\0", args.join("\0")));
    }
}
