//! # sifbox
//! Builds single-file container images and runs them as one-shot commands,
//! background instances or OCI containers.
mod commands;
mod exit_code;
mod observability;
mod rootpath;

use std::path::PathBuf;

use anyhow::Result;
use clap::{crate_version, Parser, Subcommand};

use crate::commands::{build, cache, exec, instance, oci, sign, verify};

#[derive(Parser, Debug)]
#[clap(version = sifbox_version!())]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser, Debug)]
struct GlobalOpts {
    /// set the log file to write sifbox logs to (default is '/dev/stderr')
    #[clap(short, long, global = true, overrides_with("log"))]
    log: Option<PathBuf>,
    /// change log level to debug, but the `log-level` flag takes precedence
    #[clap(long, global = true)]
    debug: bool,
    /// set the log format ('text' (default), or 'json')
    #[clap(long, global = true)]
    log_format: Option<String>,
    /// set the log level (default is 'warn', $SIFBOX_MESSAGELEVEL also applies)
    #[clap(long, global = true)]
    log_level: Option<String>,
    /// root directory to store container state
    #[clap(short, long, global = true)]
    root: Option<PathBuf>,
    /// additionally send logs to the systemd journal
    #[clap(long, global = true)]
    systemd_log: bool,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    Build(build::Build),
    #[clap(subcommand)]
    Cache(cache::CacheCmd),
    Sign(sign::Sign),
    Verify(verify::Verify),
    #[clap(subcommand)]
    Instance(instance::InstanceCmd),
    #[clap(subcommand)]
    Oci(oci::OciCmd),
    Exec(exec::Exec),
}

/// output sifbox version with the commit it was built from
#[macro_export]
macro_rules! sifbox_version {
    () => {
        concat!(
            crate_version!(),
            "\ncommit: ",
            crate_version!(),
            "-0-",
            env!("VERGEN_GIT_SHA")
        )
    };
}

fn main() {
    let opts = Opts::parse();

    if let Err(e) = observability::init(&opts) {
        eprintln!("log init failed: {e:?}");
    }

    tracing::debug!(
        "started by user {} with {:?}",
        nix::unistd::geteuid(),
        std::env::args_os()
    );

    let code = match run(opts) {
        Ok(code) => code,
        Err(err) => {
            tracing::debug!("{err:?}");
            eprintln!("FATAL: {err:#}");
            exit_code::of(&err)
        }
    };
    std::process::exit(code);
}

/// Runs the selected command and returns the process exit status.
fn run(opts: Opts) -> Result<i32> {
    let root = opts.global.root;
    match opts.subcmd {
        SubCommand::Build(args) => build::build(args).map(|_| 0),
        SubCommand::Cache(cmd) => cache::cache(cmd).map(|_| 0),
        SubCommand::Sign(args) => sign::sign(args).map(|_| 0),
        SubCommand::Verify(args) => verify::verify(args).map(|_| 0),
        SubCommand::Instance(cmd) => instance::instance(cmd),
        SubCommand::Oci(cmd) => oci::oci(cmd, root),
        SubCommand::Exec(args) => exec::exec(args),
    }
}
