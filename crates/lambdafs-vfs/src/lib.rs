// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Virtual filesystem for lambdafs
//!
//! Serves a [`lambdafs::MountContext`] over FUSE, regenerating the
//! content of qualifying files as they are opened.

#![deny(missing_docs)]

mod fuse;
mod inodes;

pub use fuse::{Config, Session};
