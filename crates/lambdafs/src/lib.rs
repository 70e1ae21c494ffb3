// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! A transforming layer over a read-write/read-only union of directories.
//!
//! Reads of qualifying files are intercepted, the configured [`Transform`]
//! is run when the file's source has changed since it was last processed,
//! and the result is written back into the writable branch so that the
//! union serves it directly from then on.

mod config;
mod context;
mod error;
mod filter;
mod layer;
mod tracker;
pub mod transform;
pub mod union;

pub use config::{Config, get_config, load_config};
pub use context::MountContext;
pub use error::{Error, OsError, Result};
pub use filter::PathFilter;
pub use layer::{Freshness, LambdaLayer};
pub use tracker::StalenessTracker;
pub use transform::Transform;
pub use union::{BranchUnion, UnionFileSystem};

/// The current version of lambdafs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-exported config sections, for callers that override values
pub mod settings {
    pub use crate::config::{Fuse, MAX_TTL, TransformKind, TransformSettings, Union};
}
