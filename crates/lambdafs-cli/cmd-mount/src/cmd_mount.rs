// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use fuser::{MountOption, SessionUnmounter};
use lambdafs::MountContext;
use lambdafs_vfs::{Config, Session};
use miette::{Context, IntoDiagnostic, Result, bail};
use tokio::signal::unix::{SignalKind, signal};

#[cfg(test)]
#[path = "./cmd_mount_test.rs"]
mod cmd_mount_test;

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    let opt = CmdMount::parse();
    if let Err(err) = lambdafs_cli_common::configure_logging(
        opt.verbosity(),
        opt.logging.log_file.as_deref(),
    ) {
        eprintln!("{err:?}");
        return 1;
    }

    let config = match lambdafs::Config::current() {
        Err(err) => {
            tracing::error!(err = ?err, "failed to load config");
            return 1;
        }
        Ok(config) => config,
    };
    let result = opt.run(&config);

    lambdafs_cli_common::exit_code(result)
}

/// Mount a union of directories, regenerating file content as it is read
///
/// The first directory is writable and receives all changes. Every
/// other directory is read-only and searched in order behind it.
#[derive(Debug, Parser)]
#[clap(name = "lambdafs", version = lambdafs::VERSION)]
pub struct CmdMount {
    #[clap(flatten)]
    logging: lambdafs_cli_common::Logging,

    /// Log everything, including each FUSE request
    #[clap(long)]
    debug: bool,

    /// Keep inode numbers within 32 bits
    #[clap(long)]
    portable: bool,

    /// How long, in seconds, the kernel may cache names and attributes
    #[clap(long, value_name = "SECONDS")]
    entry_ttl: Option<f64>,

    /// How long, in seconds, the kernel may cache names that do not exist
    #[clap(long, value_name = "SECONDS")]
    negative_ttl: Option<f64>,

    /// How long, in seconds, the deleted state of a path is cached
    #[clap(long, value_name = "SECONDS")]
    deletion_cache_ttl: Option<f64>,

    /// How long, in seconds, the branch serving a path is cached
    #[clap(long = "branchcache-ttl", value_name = "SECONDS")]
    branch_cache_ttl: Option<f64>,

    /// Directory in the writable branch used to record deletions
    #[clap(long, value_name = "NAME")]
    deletion_dirname: Option<String>,

    /// Options for the mount in the form opt1,opt2=value
    ///
    /// All of the standard fuse mount options are supported, for
    /// example: allow_other, default_permissions, ro, fsname=name
    #[clap(long, short, value_delimiter = ',')]
    options: Vec<String>,

    /// The location where to mount the union
    mountpoint: PathBuf,

    /// The writable branch, which receives all changes
    rw_dir: PathBuf,

    /// The read-only branches, searched in the order given
    #[clap(required = true)]
    ro_dirs: Vec<PathBuf>,
}

impl CmdMount {
    /// The logging verbosity requested by the command line flags
    pub fn verbosity(&self) -> usize {
        let verbosity = usize::from(self.logging.verbose);
        if self.debug {
            verbosity.max(3)
        } else {
            verbosity
        }
    }

    /// Apply any values given on the command line over the loaded config
    pub fn apply_overrides(&self, mut config: lambdafs::Config) -> lambdafs::Config {
        if self.portable {
            config.fuse.portable = true;
        }
        if let Some(ttl) = self.entry_ttl {
            config.fuse.entry_ttl = ttl;
        }
        if let Some(ttl) = self.negative_ttl {
            config.fuse.negative_ttl = ttl;
        }
        if let Some(ttl) = self.deletion_cache_ttl {
            config.union.deletion_cache_ttl = ttl;
        }
        if let Some(ttl) = self.branch_cache_ttl {
            config.union.branch_cache_ttl = ttl;
        }
        if let Some(name) = &self.deletion_dirname {
            config.union.deletion_dirname.clone_from(name);
        }
        config
    }

    /// The FUSE options for this mount
    pub fn fuse_config(&self, config: &lambdafs::Config) -> Result<Config> {
        let mut opts = Config::from_settings(&config.fuse);
        for option in parse_options_from_args(&self.options) {
            match option {
                MountOption::CUSTOM(opt) if opt.is_empty() || opt.contains('=') => {
                    bail!("Unsupported mount option, or invalid value: {opt}")
                }
                MountOption::RO if opts.mount_options.contains(&MountOption::RW) => {
                    bail!("Mount options 'ro' and 'rw' cannot be used together")
                }
                MountOption::RW if opts.mount_options.contains(&MountOption::RO) => {
                    bail!("Mount options 'ro' and 'rw' cannot be used together")
                }
                _ => {
                    opts.mount_options.insert(option);
                }
            }
        }
        let named = opts
            .mount_options
            .iter()
            .any(|o| matches!(o, MountOption::FSName(_)));
        if !named {
            opts.mount_options
                .insert(MountOption::FSName("lambdafs".into()));
        }
        Ok(opts)
    }

    pub fn run(&self, config: &lambdafs::Config) -> Result<i32> {
        let config = self.apply_overrides(config.clone());
        let opts = self.fuse_config(&config)?;
        tracing::debug!("FUSE Config: {opts:#?}");

        let mountpoint = canonical_dir(&self.mountpoint).wrap_err("Invalid mount point")?;
        let rw_dir = canonical_dir(&self.rw_dir).wrap_err("Invalid writable branch")?;
        nix::unistd::access(&rw_dir, nix::unistd::AccessFlags::W_OK)
            .into_diagnostic()
            .wrap_err_with(|| format!("Must have write access to {rw_dir:?}"))?;
        let mut ro_dirs = Vec::with_capacity(self.ro_dirs.len());
        for dir in self.ro_dirs.iter() {
            let dir = canonical_dir(dir).wrap_err("Invalid read-only branch")?;
            if dir == rw_dir {
                bail!("{dir:?} cannot be both the writable and a read-only branch");
            }
            ro_dirs.push(dir);
        }

        if !nix::unistd::geteuid().is_root() {
            // unprivileged callers must have write access to the directory that
            // they are trying to mount over.
            nix::unistd::access(&mountpoint, nix::unistd::AccessFlags::W_OK)
                .into_diagnostic()
                .wrap_err("Must have write access to mountpoint")?;
        }

        let context = MountContext::from_config(&mountpoint, &rw_dir, ro_dirs, &config)
            .wrap_err("Failed to set up the mount")?;
        tracing::debug!(?context, "Mount context");

        tracing::debug!("Establishing fuse session...");
        let mount_opts = opts.mount_options.iter().cloned().collect::<Vec<_>>();
        let mut session =
            fuser::Session::new(Session::new(Arc::new(context), opts), &mountpoint, &mount_opts)
                .into_diagnostic()
                .wrap_err("Failed to create a FUSE session")?;
        let unmounter = session.unmount_callable();

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .into_diagnostic()
            .wrap_err("Failed to establish runtime")?;

        let result = rt.block_on(async move {
            tracing::info!(?mountpoint, "Starting FUSE filesystem");
            // Although the filesystem could run in the current thread, we prefer to
            // create a blocking future that can move into tokio and be managed/scheduled
            // as desired, otherwise this thread will block and may affect the runtime
            // operation unpredictably
            let fut = tokio::task::spawn_blocking(move || session.run());
            serve(fut, unmounter).await
        });

        // we generally expect at this point that the command is complete
        // and nothing else should be executing, but it's possible that
        // we've launched long running tasks that are waiting for signals or
        // events which will never come and so we don't want to block forever
        // when the runtime is dropped.
        rt.shutdown_timeout(std::time::Duration::from_secs(2));
        result?;
        Ok(0)
    }
}

/// Wait for the session to end, unmounting early on any
/// signal that asks the process to stop
async fn serve(
    mut fut: tokio::task::JoinHandle<std::io::Result<()>>,
    mut unmounter: SessionUnmounter,
) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())
        .into_diagnostic()
        .wrap_err("interrupt signal handler")?;
    let mut quit = signal(SignalKind::quit())
        .into_diagnostic()
        .wrap_err("quit signal handler")?;
    let mut terminate = signal(SignalKind::terminate())
        .into_diagnostic()
        .wrap_err("terminate signal handler")?;

    let received = tokio::select! {
        res = &mut fut => {
            tracing::info!("Filesystem shutting down");
            return session_result(res);
        }
        _ = terminate.recv() => "Terminate",
        _ = interrupt.recv() => "Interrupt",
        _ = quit.recv() => "Quit",
    };

    tracing::info!("{received} signal received, filesystem shutting down");
    unmounter
        .unmount()
        .into_diagnostic()
        .wrap_err("Failed to unmount the filesystem")?;
    session_result(fut.await)
}

fn session_result(
    res: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    res.into_diagnostic()
        .wrap_err("FUSE session panicked")?
        .into_diagnostic()
        .wrap_err("FUSE session failed")
}

fn canonical_dir(path: &Path) -> Result<PathBuf> {
    let path = path
        .canonicalize()
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to resolve {path:?}"))?;
    if !path.is_dir() {
        bail!("{path:?} is not a directory");
    }
    Ok(path)
}

/// Copies from the private [`fuser::MountOption::from_str`]
fn parse_options_from_args(args: &[String]) -> Vec<MountOption> {
    args.iter()
        .map(|s| match s.as_str() {
            "auto_unmount" => MountOption::AutoUnmount,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "default_permissions" => MountOption::DefaultPermissions,
            "dev" => MountOption::Dev,
            "nodev" => MountOption::NoDev,
            "suid" => MountOption::Suid,
            "nosuid" => MountOption::NoSuid,
            "ro" => MountOption::RO,
            "rw" => MountOption::RW,
            "exec" => MountOption::Exec,
            "noexec" => MountOption::NoExec,
            "atime" => MountOption::Atime,
            "noatime" => MountOption::NoAtime,
            "dirsync" => MountOption::DirSync,
            "sync" => MountOption::Sync,
            "async" => MountOption::Async,
            x if x.starts_with("fsname=") => MountOption::FSName(x[7..].into()),
            x if x.starts_with("subtype=") => MountOption::Subtype(x[8..].into()),
            x => MountOption::CUSTOM(x.into()),
        })
        .collect()
}
