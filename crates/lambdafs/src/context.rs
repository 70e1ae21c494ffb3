// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{BranchUnion, Config, Freshness, LambdaLayer, PathFilter, Result, UnionFileSystem};

#[cfg(test)]
#[path = "./context_test.rs"]
mod context_test;

/// Everything a mount needs, fixed at startup and shared by all requests
#[derive(Debug)]
pub struct MountContext {
    mountpoint: PathBuf,
    rw_dir: PathBuf,
    ro_dirs: Vec<PathBuf>,
    layer: LambdaLayer,
}

impl MountContext {
    pub fn new(
        mountpoint: impl Into<PathBuf>,
        rw_dir: impl Into<PathBuf>,
        ro_dirs: Vec<PathBuf>,
        layer: LambdaLayer,
    ) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            rw_dir: rw_dir.into(),
            ro_dirs,
            layer,
        }
    }

    /// Assemble the union, transform and filter described by a config
    pub fn from_config(
        mountpoint: impl Into<PathBuf>,
        rw_dir: impl Into<PathBuf>,
        ro_dirs: Vec<PathBuf>,
        config: &Config,
    ) -> Result<Self> {
        let rw_dir = rw_dir.into();
        let union = BranchUnion::from_settings(&rw_dir, &ro_dirs, &config.union);
        let transform = crate::transform::from_settings(&config.transform)?;
        let filter = PathFilter::new(&config.transform.patterns)?;
        let layer = LambdaLayer::new(Arc::new(union), transform).with_filter(filter);
        Ok(Self::new(mountpoint, rw_dir, ro_dirs, layer))
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn rw_dir(&self) -> &Path {
        &self.rw_dir
    }

    pub fn ro_dirs(&self) -> &[PathBuf] {
        &self.ro_dirs
    }

    pub fn union(&self) -> &Arc<dyn UnionFileSystem> {
        self.layer.union()
    }

    pub fn layer(&self) -> &LambdaLayer {
        &self.layer
    }

    /// See [`LambdaLayer::ensure_fresh`]
    pub fn ensure_fresh(&self, path: &Path) -> Result<Freshness> {
        self.layer.ensure_fresh(path)
    }
}
