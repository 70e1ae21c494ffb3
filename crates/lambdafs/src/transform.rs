// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Strategies for producing new file content from a source file.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::config::{TransformKind, TransformSettings};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./transform_test.rs"]
mod transform_test;

/// Produces the content that should be served for a file.
///
/// Implementations are called concurrently for different paths, and
/// may be called more than once for the same unchanged source, in
/// which case they should produce the same result.
pub trait Transform: Send + Sync {
    /// Generate new content for the source file at the given absolute path
    fn transform(&self, path: &Path) -> Result<Vec<u8>>;
}

impl<F> Transform for F
where
    F: Fn(&Path) -> Result<Vec<u8>> + Send + Sync,
{
    fn transform(&self, path: &Path) -> Result<Vec<u8>> {
        self(path)
    }
}

/// Build the transform described by the given settings
pub fn from_settings(settings: &TransformSettings) -> Result<Arc<dyn Transform>> {
    match settings.kind {
        TransformKind::Append => Ok(Arc::new(AppendTransform::new(settings.suffix.as_bytes()))),
        TransformKind::Command => {
            let Some((program, args)) = settings.command.split_first() else {
                return Err(Error::String(
                    "The command transform requires a command to run".into(),
                ));
            };
            Ok(Arc::new(CommandTransform::new(program).with_args(args)))
        }
    }
}

/// Serves the source content with a fixed suffix appended
#[derive(Debug, Clone)]
pub struct AppendTransform {
    suffix: Vec<u8>,
}

impl AppendTransform {
    pub fn new(suffix: impl Into<Vec<u8>>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl Transform for AppendTransform {
    fn transform(&self, path: &Path) -> Result<Vec<u8>> {
        let mut content =
            std::fs::read(path).map_err(|err| Error::Io("read source", path.to_owned(), err))?;
        content.extend_from_slice(&self.suffix);
        Ok(content)
    }
}

/// Serves the output of an external command run against the source
///
/// The source path is passed as the last argument, and anything
/// written to stdout becomes the new content. A non-zero exit is
/// treated as a failed transform.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTransform {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Add leading arguments, given before the source path
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Transform for CommandTransform {
    fn transform(&self, path: &Path) -> Result<Vec<u8>> {
        tracing::trace!(program = ?self.program, ?path, "running transform command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| Error::Io("run transform command", self.program.clone(), err))?;
        if !output.status.success() {
            return Err(Error::TransformCommand {
                command: self.program.display().to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}
