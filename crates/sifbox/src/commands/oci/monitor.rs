use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use libcontainer::container::run_monitor;

/// Supervise the process of a container, spawned by `create`
#[derive(Parser, Debug)]
pub struct Monitor {
    #[clap(required = true)]
    pub container_root: PathBuf,
}

pub fn monitor(args: Monitor) -> Result<i32> {
    Ok(run_monitor(&args.container_root)?)
}
