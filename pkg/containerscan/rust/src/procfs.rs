// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Readers for the kernel process-information filesystem mounted under the
//! agent's proc root (usually the host's /proc bind-mounted at /rootfs/proc).

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::trace;
use nix::unistd::{SysconfVar, sysconf};

use crate::errors::ScanError;

const DEFAULT_TICKS_PER_SECOND: f64 = 100.0;
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Substring of the command name identifying the node's kubelet.
const KUBELET_MARKER: &str = "kubelet";

#[derive(Debug, Clone)]
pub struct Procfs {
    root: PathBuf,
}

impl Procfs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_path(&self, pid: i32, file: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(file)
    }

    /// Lists the numeric entries of the proc root. Anything else (self,
    /// sys, net, ...) is ignored.
    pub fn list_pids(&self) -> Result<BTreeSet<i32>, ScanError> {
        let entries = fs::read_dir(&self.root).map_err(|source| ScanError::ProcRoot {
            path: self.root.clone(),
            source,
        })?;

        Ok(entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter(|pid| *pid >= 0)
            .collect())
    }

    /// Reads the system uptime in seconds. Every CPU percentage depends on it,
    /// so a failure here aborts the scan cycle.
    pub fn read_uptime(&self) -> Result<f64, ScanError> {
        let path = self.root.join("uptime");
        let content = fs::read_to_string(&path)
            .map_err(|source| ScanError::Uptime { path, source })?;

        content
            .split_whitespace()
            .next()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|uptime| uptime.is_finite())
            .ok_or(ScanError::UptimeFormat { content })
    }

    pub fn stat(&self, pid: i32) -> io::Result<Stat> {
        let content = fs::read_to_string(self.pid_path(pid, "stat"))?;
        Stat::parse(&content).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed stat line for pid {pid}"),
            )
        })
    }

    pub fn cmdline(&self, pid: i32) -> io::Result<Cmdline> {
        let raw = fs::read(self.pid_path(pid, "cmdline"))?;
        Ok(Cmdline::new(String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Reads the mount table as seen by init.
    pub fn init_mounts(&self) -> Result<String, ScanError> {
        let path = self.pid_path(1, "mounts");
        fs::read_to_string(&path).map_err(|source| ScanError::MountTable { path, source })
    }

    /// Samples a single process, returning `None` if its stat line cannot be
    /// read or parsed (the process may have exited in the meantime).
    pub fn sample_process(&self, pid: i32, uptime: f64, units: &SystemUnits) -> Option<ProcessSample> {
        match self.stat(pid) {
            Ok(stat) => Some(ProcessSample::from_stat(&stat, uptime, units)),
            Err(e) => {
                trace!("skipping pid {pid}: {e}");
                None
            }
        }
    }

    /// Samples every pid and flags the kubelet along the way.
    pub fn sample_processes(
        &self,
        pids: &BTreeSet<i32>,
        uptime: f64,
        units: &SystemUnits,
    ) -> ProcessTable {
        let mut table = ProcessTable::default();
        for pid in pids {
            let Some(sample) = self.sample_process(*pid, uptime, units) else {
                continue;
            };
            if table.kubelet_pid.is_none() && sample.command_name.contains(KUBELET_MARKER) {
                table.kubelet_pid = Some(sample.pid);
            }
            table.samples.push(sample);
        }
        table
    }
}

#[derive(Debug, Default)]
pub struct ProcessTable {
    pub samples: Vec<ProcessSample>,
    pub kubelet_pid: Option<i32>,
}

/// Kernel units needed to interpret accounting fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemUnits {
    pub ticks_per_second: f64,
    pub page_size: u64,
}

impl SystemUnits {
    pub fn detect() -> Self {
        let ticks_per_second = sysconf(SysconfVar::CLK_TCK)
            .ok()
            .flatten()
            .filter(|ticks| *ticks > 0)
            .map(|ticks| ticks as f64)
            .unwrap_or(DEFAULT_TICKS_PER_SECOND);
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|size| u64::try_from(size).ok())
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE);

        Self {
            ticks_per_second,
            page_size,
        }
    }
}

impl Default for SystemUnits {
    fn default() -> Self {
        Self {
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// The subset of /proc/<pid>/stat this agent cares about. Field numbers in
/// the comments follow proc(5).
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub pid: i32,
    pub comm: String,
    /// (4) ppid
    pub ppid: i32,
    /// (14) utime, clock ticks
    pub utime: u64,
    /// (15) stime, clock ticks
    pub stime: u64,
    /// (16) cutime, clock ticks
    pub cutime: i64,
    /// (17) cstime, clock ticks
    pub cstime: i64,
    /// (22) starttime, clock ticks since boot
    pub starttime: u64,
    /// (24) rss, pages
    pub rss: i64,
}

impl Stat {
    /// Parses a stat line. The command name sits between the first '(' and
    /// the last ')' since it may itself contain spaces and parentheses.
    pub fn parse(line: &str) -> Option<Self> {
        let (head, tail) = line.trim_end().rsplit_once(')')?;
        let (pid, comm) = head.split_once('(')?;
        let fields: Vec<&str> = tail.split_whitespace().collect();

        Some(Stat {
            pid: pid.trim().parse().ok()?,
            comm: comm.to_string(),
            ppid: stat_field(&fields, 4)?,
            utime: stat_field(&fields, 14)?,
            stime: stat_field(&fields, 15)?,
            cutime: stat_field(&fields, 16)?,
            cstime: stat_field(&fields, 17)?,
            starttime: stat_field(&fields, 22)?,
            rss: stat_field(&fields, 24)?,
        })
    }
}

/// `fields` starts at field (3), the process state.
fn stat_field<T: FromStr>(fields: &[&str], number: usize) -> Option<T> {
    fields.get(number.checked_sub(3)?)?.parse().ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub pid: i32,
    pub command_name: String,
    pub cpu_percent: f64,
    pub resident_memory_bytes: u64,
}

impl ProcessSample {
    /// Computes the lifetime CPU percentage of the process (including waited-for
    /// children) and its resident memory.
    pub fn from_stat(stat: &Stat, uptime: f64, units: &SystemUnits) -> Self {
        let ticks = units.ticks_per_second;
        let total_ticks =
            stat.utime as f64 + stat.stime as f64 + stat.cutime as f64 + stat.cstime as f64;
        let elapsed = uptime - stat.starttime as f64 / ticks;

        let cpu_percent = if elapsed > 0.0 {
            100.0 * (total_ticks / ticks) / elapsed
        } else {
            0.0
        };

        ProcessSample {
            pid: stat.pid,
            command_name: stat.comm.clone(),
            cpu_percent: if cpu_percent.is_finite() {
                cpu_percent.max(0.0)
            } else {
                0.0
            },
            resident_memory_bytes: u64::try_from(stat.rss)
                .unwrap_or(0)
                .saturating_mul(units.page_size),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cmdline {
    cmdline: String,
    separator: char,
}

impl Cmdline {
    pub fn new(mut cmdline: String) -> Self {
        // Command lines from proc can have trailing null bytes if the process
        // has replaced part of it.
        let trim_len = cmdline.trim_end_matches('\0').len();

        // This won't panic since trim_len should always lie on a char boundary.
        cmdline.truncate(trim_len);

        // A process that rewrote its command line may have packed all of its
        // arguments into a single space-separated string.
        let mut args = cmdline.split_terminator('\0');
        let separator = if let (Some(first), None) = (args.next(), args.next())
            && first.contains(' ')
        {
            ' '
        } else {
            '\0'
        };

        Cmdline { cmdline, separator }
    }

    pub fn args(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.cmdline.split_terminator(self.separator)
    }

    pub fn is_empty(&self) -> bool {
        self.cmdline.is_empty()
    }

    /// Returns whether any argument contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.args().any(|arg| arg.contains(needle))
    }

    /// Returns the argument following the first argument equal to `flag`.
    pub fn value_after(&self, flag: &str) -> Option<&str> {
        let mut args = self.args();
        args.find(|arg| *arg == flag)?;
        args.next()
    }

    /// Returns the value of a long option given either as `--name=value` or
    /// as `--name value`. The number of leading dashes is not significant.
    pub fn option_value(&self, name: &str) -> Option<&str> {
        let mut args = self.args();
        while let Some(arg) = args.next() {
            let Some(option) = arg.strip_prefix('-') else {
                continue;
            };
            let option = option.trim_start_matches('-');
            if let Some((key, value)) = option.split_once('=') {
                if key == name {
                    return Some(value);
                }
            } else if option == name {
                return args.next();
            }
        }
        None
    }
}

impl From<&str> for Cmdline {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

impl From<&[&str]> for Cmdline {
    fn from(value: &[&str]) -> Self {
        let joined = value.join("\0");
        Self::new(joined)
    }
}

/// Creates a `Cmdline` from a list of arguments, joined with null bytes like
/// the kernel does in `/proc/<pid>/cmdline`.
#[macro_export]
macro_rules! cmdline {
    () => {
        $crate::Cmdline::new(String::new())
    };
    ($($arg:expr),* $(,)?) => { $crate::Cmdline::from(&[$($arg),*][..]) };
}
