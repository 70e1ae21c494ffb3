// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

static CONFIG: OnceCell<RwLock<Arc<Config>>> = OnceCell::new();

/// The name of the directory in the writable branch that
/// holds deletion markers, unless configured otherwise
pub const DEFAULT_DELETION_DIRNAME: &str = "GOUNIONFS_DELETIONS";

/// The longest cache TTL that will be used, larger values are clamped
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Settings given as a list of values, and the separator used
/// to split them when they come from an environment variable
const LIST_SETTINGS: &[(&str, Option<char>)] =
    &[("transform.command", None), ("transform.patterns", Some(','))];

/// Settings for the union of branches underneath the mount
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Union {
    /// How long, in seconds, a path's deleted state is cached
    pub deletion_cache_ttl: f64,

    /// How long, in seconds, the branch serving a path is cached
    pub branch_cache_ttl: f64,

    /// Directory in the writable branch used to record deletions
    pub deletion_dirname: String,
}

impl Default for Union {
    fn default() -> Self {
        Self {
            deletion_cache_ttl: 5.0,
            branch_cache_ttl: 5.0,
            deletion_dirname: DEFAULT_DELETION_DIRNAME.to_string(),
        }
    }
}

impl Union {
    pub fn deletion_cache_ttl(&self) -> Duration {
        seconds(self.deletion_cache_ttl)
    }

    pub fn branch_cache_ttl(&self) -> Duration {
        seconds(self.branch_cache_ttl)
    }
}

/// Settings for the kernel side of the mount
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Fuse {
    /// Entry and attribute cache TTL, in seconds
    pub entry_ttl: f64,

    /// Cache TTL for names that do not exist, in seconds
    pub negative_ttl: f64,

    /// Keep inode numbers within 32 bits
    pub portable: bool,
}

impl Default for Fuse {
    fn default() -> Self {
        Self {
            entry_ttl: 1.0,
            negative_ttl: 1.0,
            portable: false,
        }
    }
}

impl Fuse {
    pub fn entry_ttl(&self) -> Duration {
        seconds(self.entry_ttl)
    }

    pub fn negative_ttl(&self) -> Duration {
        seconds(self.negative_ttl)
    }
}

/// The available content transforms
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    /// Append a fixed suffix to the source content
    #[default]
    Append,
    /// Replace the content with the output of an external command
    Command,
}

/// Settings for the transform applied to file content
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TransformSettings {
    pub kind: TransformKind,

    /// The text appended by the append transform
    pub suffix: String,

    /// The program and leading arguments of the command transform.
    ///
    /// The source file path is given as the final argument and
    /// the command's stdout becomes the new content.
    pub command: Vec<String>,

    /// Glob patterns, relative to the mount, that select which
    /// files are transformed. All files are transformed when empty.
    pub patterns: Vec<String>,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            kind: TransformKind::default(),
            suffix: "\nhello".to_string(),
            command: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

/// Configuration values for lambdafs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // These sub-types should aim to only have one level of
    // values within them, otherwise they become impossible to address
    // with environment variables.
    pub union: Union,
    pub fuse: Fuse,
    pub transform: TransformSettings,
}

impl Config {
    /// Get the current loaded config, loading it if needed
    pub fn current() -> Result<Arc<Self>> {
        get_config()
    }

    /// Load a config from toml source, mostly useful for testing
    pub fn load_string<S: AsRef<str>>(conf: S) -> Result<Self> {
        use config::{Config as RawConfig, File, FileFormat};

        let config = RawConfig::builder()
            .add_source(File::from_str(conf.as_ref(), FileFormat::Toml))
            .build()?;
        Ok(Config::deserialize(config)?)
    }
}

/// Get the current lambdafs config, fetching it from disk if needed.
pub fn get_config() -> Result<Arc<Config>> {
    let config = CONFIG.get_or_try_init(|| -> Result<RwLock<Arc<Config>>> {
        Ok(RwLock::new(Arc::new(load_config()?)))
    })?;
    let lock = config
        .read()
        .map_err(|err| crate::Error::LockPoisonedRead(err.to_string()))?;
    Ok(Arc::clone(&*lock))
}

/// Load the lambdafs configuration from disk, even if it has already been loaded.
///
/// This includes the default, user, and system configurations (if they exist)
/// as well as any `LAMBDAFS_<SECTION>_<NAME>` environment variables.
pub fn load_config() -> Result<Config> {
    load_config_from_vars(std::env::vars())
}

fn load_config_from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Config> {
    use config::{Config as RawConfig, File};

    let mut config_builder = RawConfig::builder()
        // the system config can also be in any support format: toml, yaml, json, ini, etc
        .add_source(File::with_name("/etc/lambdafs").required(false));
    if let Some(home) = dirs::home_dir() {
        let user_config = home.join(".config").join("lambdafs").join("lambdafs");
        config_builder = config_builder
            .add_source(File::with_name(&format!("{}", user_config.display())).required(false));
    }

    for (var, value) in vars {
        let Some(tail) = var.strip_prefix("LAMBDAFS_") else {
            continue;
        };
        let Some((section, name)) = tail.split_once('_') else {
            // a value with no section is not a configuration
            // value, and can be skipped (eg: LAMBDAFS_LOG)
            continue;
        };

        let key = format!("{}.{}", section.to_lowercase(), name.to_lowercase());
        let list = LIST_SETTINGS
            .iter()
            .find(|(setting, _)| *setting == key)
            .map(|(_, sep)| split_list(&value, *sep));
        config_builder = match list {
            Some(items) => config_builder.set_override(key, items)?,
            None => config_builder.set_override(key, value)?,
        };
    }

    let config = config_builder.build()?;
    Ok(Config::deserialize(config)?)
}

/// Split a list setting, on whitespace when no separator is given
fn split_list(value: &str, sep: Option<char>) -> Vec<String> {
    let items: Vec<&str> = match sep {
        Some(sep) => value.split(sep).map(str::trim).collect(),
        None => value.split_whitespace().collect(),
    };
    items
        .into_iter()
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn seconds(value: f64) -> Duration {
    if !(value.is_finite() && value > 0.0) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).map_or(MAX_TTL, |ttl| ttl.min(MAX_TTL))
}
