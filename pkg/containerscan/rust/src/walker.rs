// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Depth-bounded listing of a container filesystem tree.
//!
//! Paths are reported relative to the walk root with a leading `/`, and
//! directories end with `/`. Symbolic links are resolved as if the walk root
//! were the filesystem root, and all filesystem access goes through
//! [`SubDirFs`] so nothing outside the root is ever read.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Component, Path, PathBuf};

use log::{debug, trace};
use normalize_path::NormalizePath;

use crate::errors::ScanError;
use crate::fs::SubDirFs;

/// Deepest level reported by a scan; entries directly under the root are at
/// depth 0.
pub const MAX_WALK_DEPTH: usize = 3;

/// Same bound as the kernel's MAXSYMLINKS.
const MAX_SYMLINK_HOPS: usize = 40;

struct Child {
    name: OsString,
    is_dir: bool,
    is_symlink: bool,
}

fn sorted_children(fs: &SubDirFs, dir: &Path) -> io::Result<Vec<Child>> {
    let mut children: Vec<Child> = fs
        .read_dir(dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => {
                    trace!("skipping {:?} in {}: {e}", entry.file_name(), dir.display());
                    return None;
                }
            };
            Some(Child {
                name: entry.file_name(),
                is_dir: file_type.is_dir(),
                is_symlink: file_type.is_symlink(),
            })
        })
        .collect();
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}

fn display(rel: &Path, is_dir: bool) -> String {
    let mut path = format!("/{}", rel.to_string_lossy());
    if is_dir && !path.ends_with('/') {
        path.push('/');
    }
    path
}

/// Resolves a link target found in directory `parent` to a root-relative
/// path. Absolute targets are re-rooted under the walk root. Returns `None`
/// for targets climbing above the root.
fn resolve_link(parent: &Path, target: &Path) -> Option<PathBuf> {
    let candidate = match target.strip_prefix("/") {
        Ok(absolute) => absolute.to_path_buf(),
        Err(_) => parent.join(target),
    };

    let mut depth = 0usize;
    for component in candidate.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => depth = depth.checked_sub(1)?,
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    Some(candidate.normalize())
}

/// Resolves every symbolic link along the root-relative path `path`,
/// including intermediate components, treating the walk root as `/`. The
/// result names a file or directory reached without following any link.
/// Returns `None` if some link on the way climbs above the root.
fn resolve_in_root(fs: &SubDirFs, path: &Path) -> io::Result<Option<PathBuf>> {
    let mut resolved = PathBuf::new();
    // Components still to check, next one last
    let mut pending: Vec<OsString> = path.iter().rev().map(OsStr::to_os_string).collect();
    let mut hops = 0;

    while let Some(name) = pending.pop() {
        let candidate = resolved.join(&name);
        if !fs.symlink_metadata(&candidate)?.is_symlink() {
            resolved = candidate;
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(io::Error::other("too many levels of symbolic links"));
        }
        let target = fs.read_link_contents(&candidate)?;
        let Some(next) = resolve_link(&resolved, &target) else {
            return Ok(None);
        };
        pending.extend(next.iter().rev().map(OsStr::to_os_string));
        resolved = PathBuf::new();
    }

    Ok(Some(resolved))
}

struct TreeWalker<'a> {
    fs: &'a SubDirFs,
    max_depth: usize,
    entries: Vec<String>,
}

impl TreeWalker<'_> {
    fn visit(&mut self, rel: &Path, children: Vec<Child>, depth: usize) -> Result<(), ScanError> {
        for child in children {
            let child_rel = rel.join(&child.name);
            if child.is_dir {
                if depth < self.max_depth {
                    self.entries.push(display(&child_rel, true));
                    self.descend(&child_rel, depth + 1)?;
                }
            } else if child.is_symlink {
                self.visit_symlink(&child_rel, depth)?;
            } else {
                self.entries.push(display(&child_rel, false));
            }
        }
        Ok(())
    }

    /// Lists a subdirectory. An unreadable subdirectory is reported but not
    /// listed.
    fn descend(&mut self, rel: &Path, depth: usize) -> Result<(), ScanError> {
        match sorted_children(self.fs, rel) {
            Ok(children) => self.visit(rel, children, depth),
            Err(e) => {
                debug!(
                    "not listing {}: {e}",
                    self.fs.root_path().join(rel).display()
                );
                Ok(())
            }
        }
    }

    fn visit_symlink(&mut self, link: &Path, depth: usize) -> Result<(), ScanError> {
        let link_error = |source| ScanError::SymlinkTarget {
            path: self.fs.root_path().join(link),
            source,
        };

        let Some(resolved) = resolve_in_root(self.fs, link).map_err(link_error)? else {
            trace!("{} points outside of the root, not following", link.display());
            self.entries.push(display(link, false));
            return Ok(());
        };

        let metadata = self.fs.metadata(&resolved).map_err(link_error)?;
        if metadata.is_dir() && depth < self.max_depth {
            self.entries.push(display(&resolved, true));
            self.descend(&resolved, depth + 1)
        } else {
            self.entries.push(display(&resolved, false));
            Ok(())
        }
    }
}

/// Lists the tree under `root` down to `max_depth`, in name order within
/// each directory. Directories deeper than `max_depth - 1` are not reported;
/// leaves are reported down to `max_depth`.
///
/// An unreadable root, or a symbolic link whose target cannot be read or
/// stat'ed, fails the whole walk.
pub fn walk<P: AsRef<Path>>(root: P, max_depth: usize) -> Result<Vec<String>, ScanError> {
    let root = root.as_ref();
    let root_error = |source| ScanError::WalkRoot {
        path: root.to_path_buf(),
        source,
    };

    let fs = SubDirFs::new(root).map_err(root_error)?;
    let children = sorted_children(&fs, Path::new("")).map_err(root_error)?;

    let mut walker = TreeWalker {
        fs: &fs,
        max_depth,
        entries: Vec::new(),
    };
    walker.visit(Path::new(""), children, 0)?;
    Ok(walker.entries)
}
