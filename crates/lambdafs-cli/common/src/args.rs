// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lambdafs::OsError;
use miette::{Context, IntoDiagnostic, Result};
use tracing_subscriber::prelude::*;

#[cfg(test)]
#[path = "./args_test.rs"]
mod args_test;

/// Environment variable holding the default log directives
pub const LAMBDAFS_LOG: &str = "LAMBDAFS_LOG";

/// Command line flags for configuring log output
#[derive(Debug, Clone, clap::Args)]
pub struct Logging {
    /// Make output more verbose, can be specified more than once
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Additionally log output to the provided file
    #[clap(long, global = true, env = "LAMBDAFS_LOG_FILE", value_hint = clap::ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,
}

/// The filter directives used for a level of verbosity.
///
/// The `existing` directives (usually from [`LAMBDAFS_LOG`]) are only
/// used when no verbosity was requested, while the `overrides` (usually
/// from `RUST_LOG`) are always appended.
pub fn log_directives(verbosity: usize, existing: Option<&str>, overrides: Option<&str>) -> String {
    let mut directives = match verbosity {
        0 => existing.unwrap_or("lambdafs=info,warn").to_string(),
        1 => "lambdafs=debug,info".to_string(),
        2 => "lambdafs=trace,info".to_string(),
        3 => "lambdafs=trace,fuser=debug,info".to_string(),
        _ => "trace".to_string(),
    };
    if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
        directives.push(',');
        directives.push_str(overrides);
    }
    directives
}

pub fn configure_logging(verbosity: usize, log_file: Option<&Path>) -> Result<()> {
    let existing = std::env::var(LAMBDAFS_LOG).ok();
    let overrides = std::env::var("RUST_LOG").ok();
    let directives = log_directives(verbosity, existing.as_deref(), overrides.as_deref());

    let stderr_log = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(verbosity > 2)
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::filter::EnvFilter::new(&directives));

    let file_log = match log_file {
        None => None,
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("Failed to create log directory {parent:?}"))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to open log file {path:?}"))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(tracing_subscriber::filter::EnvFilter::new(&directives)),
            )
        }
    };

    let sub = tracing_subscriber::registry().with(stderr_log).with(file_log);
    tracing::subscriber::set_global_default(sub)
        .into_diagnostic()
        .wrap_err("Failed to set default logger")
}

/// Report the outcome of a command, returning the process exit code
pub fn exit_code(result: Result<i32>) -> i32 {
    let err = match result {
        Ok(code) => return code,
        Err(err) => err,
    };
    let out_of_space = err.chain().any(|cause| {
        let errno = match cause.downcast_ref::<lambdafs::Error>() {
            Some(err) => err.os_error(),
            None => cause
                .downcast_ref::<std::io::Error>()
                .and_then(|err| err.os_error()),
        };
        errno == Some(libc::ENOSPC)
    });
    if out_of_space {
        tracing::error!("Out of disk space: {err}");
    } else {
        tracing::error!("{err:?}");
    }
    1
}
