// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::union::relative_path;
use crate::{Error, PathFilter, Result, StalenessTracker, Transform, UnionFileSystem};

#[cfg(test)]
#[path = "./layer_test.rs"]
mod layer_test;

/// The outcome of making sure that a file's content is current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The path is not subject to transformation
    Unqualified,
    /// The content was already generated from the current source
    Current,
    /// The content was generated and written back
    Regenerated { bytes: usize },
}

/// Regenerates transformed content in the writable branch of a union
/// whenever the source of a file changes.
pub struct LambdaLayer {
    union: Arc<dyn UnionFileSystem>,
    transform: Arc<dyn Transform>,
    filter: PathFilter,
    tracker: StalenessTracker,
}

impl LambdaLayer {
    pub fn new(union: Arc<dyn UnionFileSystem>, transform: Arc<dyn Transform>) -> Self {
        Self {
            union,
            transform,
            filter: PathFilter::all(),
            tracker: StalenessTracker::new(),
        }
    }

    /// Only transform the paths accepted by this filter
    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn union(&self) -> &Arc<dyn UnionFileSystem> {
        &self.union
    }

    pub fn tracker(&self) -> &StalenessTracker {
        &self.tracker
    }

    /// Make sure that the content served for `path` reflects its source.
    ///
    /// When the source has changed since it was last processed, the
    /// transform is run and its output replaces the file in the writable
    /// branch. On failure nothing is recorded, so that the next call
    /// tries again.
    pub fn ensure_fresh(&self, path: &Path) -> Result<Freshness> {
        let path = relative_path(path)?;
        if !self.filter.matches(&path) {
            return Ok(Freshness::Unqualified);
        }
        let Some(source) = self.union.source(&path)? else {
            return Ok(Freshness::Unqualified);
        };
        if !self.tracker.is_stale(&path, source.modified) {
            tracing::debug!(?path, "transformed content is current");
            return Ok(Freshness::Current);
        }

        // anything that changes the source after this point
        // leaves it newer than the record, and stale again
        let started = SystemTime::now();
        let content = match self.transform.transform(&source.path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(?path, "transform failed: {err}");
                return Err(Error::Transform(path, Box::new(err)));
            }
        };
        if let Err(err) = self.union.write_file(&path, &content, source.mode) {
            tracing::warn!(?path, "failed to write back transformed content: {err}");
            return Err(Error::WriteBack(path, Box::new(err)));
        }
        self.tracker.mark_processed(&path, started);

        tracing::info!(?path, bytes = content.len(), "regenerated");
        Ok(Freshness::Regenerated {
            bytes: content.len(),
        })
    }
}

impl std::fmt::Debug for LambdaLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaLayer")
            .field("filter", &self.filter)
            .field("tracked", &self.tracker.len())
            .finish_non_exhaustive()
    }
}
