// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Common argument structures and helpers for the lambdafs command line

mod args;

pub use args::{LAMBDAFS_LOG, Logging, configure_logging, exit_code, log_directives};
