// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::collections::HashSet;

/// Suffix appended to merged-view entries that also exist in the upper layer.
pub const MODIFIED_MARKER: &str = " MODIFIED";

/// Marks every entry of the merged walk whose path also appears in the diff
/// walk. Entries already carrying the marker are matched on their bare path
/// and left as they are.
///
/// Paths found only in the diff walk (such as the whiteouts left by deleted
/// files) are not added to the result.
pub fn mark_modified(merged: Vec<String>, diff: &[String]) -> Vec<String> {
    let changed: HashSet<&str> = diff.iter().map(|entry| base_path(entry)).collect();

    merged
        .into_iter()
        .map(|entry| {
            if entry.ends_with(MODIFIED_MARKER) || !changed.contains(entry.as_str()) {
                entry
            } else {
                entry + MODIFIED_MARKER
            }
        })
        .collect()
}

fn base_path(entry: &str) -> &str {
    entry.strip_suffix(MODIFIED_MARKER).unwrap_or(entry)
}
