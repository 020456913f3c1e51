// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use log::trace;

use crate::identity::PodIdentity;
use crate::procfs::{Cmdline, Procfs};
use crate::runtime::RuntimeKind;

/// Upper bound on the number of parent hops taken from any pid. Real process
/// trees are far shallower; a walk hitting this bound resolves to the host.
pub const MAX_ANCESTRY_DEPTH: usize = 64;

const INIT_PID: i32 = 1;
const KTHREADD_PID: i32 = 2;

/// pid -> parent pid, for every process whose stat line could be read.
#[derive(Debug, Default, Clone)]
pub struct PidAncestry {
    parents: HashMap<i32, i32>,
}

impl PidAncestry {
    pub fn build(procfs: &Procfs, pids: &BTreeSet<i32>) -> Self {
        pids.iter()
            .filter_map(|pid| match procfs.stat(*pid) {
                Ok(stat) => Some((*pid, stat.ppid)),
                Err(e) => {
                    trace!("no parent for pid {pid}: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn parent(&self, pid: i32) -> Option<i32> {
        self.parents.get(&pid).copied()
    }

    pub fn pids(&self) -> impl Iterator<Item = i32> + '_ {
        self.parents.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

impl FromIterator<(i32, i32)> for PidAncestry {
    fn from_iter<T: IntoIterator<Item = (i32, i32)>>(iter: T) -> Self {
        PidAncestry {
            parents: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShimLookup {
    Host,
    Container(String),
}

/// Walks up from `pid` to the child of init and decides whether it is a
/// runtime shim. If it is, the container id is taken from the shim's command
/// line.
///
/// The walk stops at init's children, at kernel threads (children of
/// kthreadd), at unknown parents, on cycles, and after
/// `MAX_ANCESTRY_DEPTH` hops.
pub fn resolve_shim<F>(
    pid: i32,
    ancestry: &PidAncestry,
    runtime: RuntimeKind,
    mut cmdline_of: F,
) -> ShimLookup
where
    F: FnMut(i32) -> Option<Cmdline>,
{
    let mut visited = HashSet::new();
    let mut current = pid;

    for _ in 0..MAX_ANCESTRY_DEPTH {
        if !visited.insert(current) {
            trace!("ancestry cycle through pid {current} while resolving {pid}");
            return ShimLookup::Host;
        }

        match ancestry.parent(current) {
            Some(INIT_PID) => return shim_container_id(cmdline_of(current), runtime),
            Some(KTHREADD_PID) => return ShimLookup::Host,
            Some(parent) if parent > 0 => current = parent,
            _ => return ShimLookup::Host,
        }
    }

    trace!("ancestry of pid {pid} deeper than {MAX_ANCESTRY_DEPTH}");
    ShimLookup::Host
}

fn shim_container_id(cmdline: Option<Cmdline>, runtime: RuntimeKind) -> ShimLookup {
    let Some(cmdline) = cmdline else {
        return ShimLookup::Host;
    };
    if !cmdline.contains(runtime.shim_marker()) {
        return ShimLookup::Host;
    }

    match cmdline.value_after(runtime.id_flag()) {
        Some(id) if !id.is_empty() => ShimLookup::Container(id.to_string()),
        _ => ShimLookup::Host,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Host,
    Container {
        pod_name: String,
        container_id: String,
    },
}

impl Owner {
    pub fn container_id(&self) -> Option<&str> {
        match self {
            Owner::Host => None,
            Owner::Container { container_id, .. } => Some(container_id),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Host => write!(f, "Host"),
            Owner::Container {
                pod_name,
                container_id,
            } => write!(f, "{pod_name}/{container_id}"),
        }
    }
}

pub type Ownership = BTreeMap<i32, Owner>;

/// Attributes every pid of `ancestry` to the host or to a pod container.
///
/// Shim command lines and container identities are looked up at most once
/// per call. A container whose identity cannot be loaded is attributed to
/// the host.
pub fn resolve_ownership<C, I>(
    ancestry: &PidAncestry,
    runtime: RuntimeKind,
    mut cmdline_of: C,
    mut identity_of: I,
) -> Ownership
where
    C: FnMut(i32) -> Option<Cmdline>,
    I: FnMut(&str) -> Option<PodIdentity>,
{
    let mut cmdlines: HashMap<i32, Option<Cmdline>> = HashMap::new();
    let mut identities: HashMap<String, Option<PodIdentity>> = HashMap::new();
    let mut ownership = Ownership::new();

    for pid in ancestry.pids() {
        let lookup = resolve_shim(pid, ancestry, runtime, |shim| {
            cmdlines
                .entry(shim)
                .or_insert_with(|| cmdline_of(shim))
                .clone()
        });

        let owner = match lookup {
            ShimLookup::Host => Owner::Host,
            ShimLookup::Container(container_id) => {
                let identity = identities
                    .entry(container_id.clone())
                    .or_insert_with(|| identity_of(&container_id));
                match identity {
                    Some(identity) => Owner::Container {
                        pod_name: identity.pod_name.clone(),
                        container_id,
                    },
                    None => Owner::Host,
                }
            }
        };
        ownership.insert(pid, owner);
    }

    ownership
}

/// Returns the distinct (pod name, container id) pairs of `ownership`, in pid
/// order of their first process.
pub fn distinct_containers(ownership: &Ownership) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    ownership
        .values()
        .filter_map(|owner| match owner {
            Owner::Host => None,
            Owner::Container {
                pod_name,
                container_id,
            } => seen
                .insert(container_id.as_str())
                .then(|| (pod_name.clone(), container_id.clone())),
        })
        .collect()
}
