// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;

#[cfg(test)]
#[path = "./tracker_test.rs"]
mod tracker_test;

/// Remembers when each path was last transformed and written back.
///
/// A path with no record has never been processed and is always
/// stale. Records are only ever added or moved forward in time, and
/// live for as long as the tracker does.
#[derive(Debug, Default)]
pub struct StalenessTracker {
    processed: DashMap<PathBuf, SystemTime>,
}

impl StalenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `path` needs to be processed, given the current
    /// modification time of its source.
    ///
    /// A source touched without any change to its content is still
    /// considered stale, as only timestamps are compared.
    pub fn is_stale(&self, path: &Path, modified: SystemTime) -> bool {
        match self.processed.get(path) {
            None => true,
            Some(processed) => modified > *processed,
        }
    }

    /// Record that `path` was successfully processed from a
    /// source read at or after `at`.
    ///
    /// When racing with another request for the same path, the
    /// newest timestamp wins.
    pub fn mark_processed(&self, path: &Path, at: SystemTime) {
        self.processed
            .entry(path.to_owned())
            .and_modify(|processed| {
                if at > *processed {
                    *processed = at;
                }
            })
            .or_insert(at);
    }

    /// The time that `path` was last processed, if ever
    pub fn last_processed(&self, path: &Path) -> Option<SystemTime> {
        self.processed.get(path).map(|r| *r.value())
    }

    /// The number of distinct paths that have been processed
    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}
