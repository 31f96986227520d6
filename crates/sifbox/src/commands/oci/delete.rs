use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libcontainer::instance::OCI_SUBDIR;

use crate::commands::{load_container, registry};

/// Release any resources held by the container
#[derive(Parser, Debug)]
pub struct Delete {
    /// Kill the container first if it is still running
    #[clap(short, long)]
    pub force: bool,
    #[clap(required = true)]
    pub container_id: String,
}

pub fn delete(args: Delete, root_path: PathBuf) -> Result<()> {
    tracing::debug!("start deleting {}", args.container_id);
    let mut container = load_container(&root_path, &args.container_id)?;
    let registry = registry(OCI_SUBDIR, None)?;
    container
        .delete(args.force, Some(&registry))
        .with_context(|| format!("failed to delete container {}", args.container_id))
}
