// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[error("{0}")]
    String(String),
    #[error("[ERRNO {1}] {0}")]
    Errno(String, i32),
    #[error("Failed to {0}: {}", .1.display())]
    Io(&'static str, PathBuf, #[source] io::Error),
    #[error("Invalid path {0:?}, must be relative to the mount and not escape it")]
    InvalidPath(PathBuf),
    #[error("Invalid path pattern {0:?}")]
    InvalidPattern(String, #[source] glob::PatternError),

    #[error("Transform failed for {}", .0.display())]
    #[diagnostic(code("lambdafs::transform"))]
    Transform(PathBuf, #[source] Box<Error>),
    #[error("Transform command {command:?} failed ({status}): {stderr}")]
    #[diagnostic(code("lambdafs::transform"))]
    TransformCommand {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Failed to write back transformed content for {}", .0.display())]
    #[diagnostic(code("lambdafs::write_back"))]
    WriteBack(PathBuf, #[source] Box<Error>),

    #[error("Cannot load config, lock has been poisoned: {0}")]
    LockPoisonedRead(String),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub fn new_errno<E: Into<String>>(errno: i32, e: E) -> Error {
        Error::Errno(e.into(), errno)
    }

    pub fn not_found(path: impl Into<PathBuf>) -> Error {
        Error::Io("find", path.into(), io::Error::from_raw_os_error(libc::ENOENT))
    }

    /// True if this error means that the requested path does not exist
    pub fn is_not_found(&self) -> bool {
        self.os_error() == Some(libc::ENOENT)
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::String(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Self::String(err.to_string())
    }
}

/// Errors that can be reported back through the filesystem as an errno
pub trait OsError {
    /// The errno that best describes this error, if any
    fn os_error(&self) -> Option<i32>;
}

impl OsError for Error {
    fn os_error(&self) -> Option<i32> {
        match self {
            Error::Errno(_, errno) => Some(*errno),
            Error::Io(_, _, err) => err.os_error(),
            Error::InvalidPath(_) => Some(libc::EINVAL),
            // the reader only ever sees a failed read, whatever
            // went wrong while regenerating the content
            Error::Transform(..) | Error::TransformCommand { .. } | Error::WriteBack(..) => {
                Some(libc::EIO)
            }
            _ => None,
        }
    }
}

impl OsError for io::Error {
    fn os_error(&self) -> Option<i32> {
        match self.raw_os_error() {
            Some(errno) => Some(errno),
            None => match self.kind() {
                io::ErrorKind::NotFound => Some(libc::ENOENT),
                io::ErrorKind::PermissionDenied => Some(libc::EACCES),
                io::ErrorKind::AlreadyExists => Some(libc::EEXIST),
                io::ErrorKind::UnexpectedEof => Some(libc::EIO),
                _ => None,
            },
        }
    }
}
