//! Contains functionality of kill container command
use std::convert::TryInto;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use libcontainer::signal::Signal;

use crate::commands::load_container;

/// Send the specified signal to the container
#[derive(Parser, Debug)]
pub struct Kill {
    /// Seconds to wait for the container to stop before it is killed
    #[clap(short, long)]
    pub timeout: Option<u64>,
    #[clap(required = true)]
    pub container_id: String,
    #[clap(default_value = "SIGTERM")]
    pub signal: String,
}

pub fn kill(args: Kill, root_path: PathBuf) -> Result<()> {
    let mut container = load_container(&root_path, &args.container_id)?;
    let signal: Signal = args.signal.as_str().try_into()?;
    container.kill(signal, args.timeout.map(Duration::from_secs))?;
    Ok(())
}
