//! Contains functionality of pause container command
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::commands::load_container;

/// Suspend the processes within the container
#[derive(Parser, Debug)]
pub struct Pause {
    #[clap(required = true)]
    pub container_id: String,
}

// Freezing is delegated to the freezer controller of the container's cgroup,
// so pausing requires the container to have been created with one.
pub fn pause(args: Pause, root_path: PathBuf) -> Result<()> {
    tracing::debug!("start pausing container {}", args.container_id);
    let mut container = load_container(&root_path, &args.container_id)?;
    container
        .pause()
        .with_context(|| format!("failed to pause container {}", args.container_id))
}
