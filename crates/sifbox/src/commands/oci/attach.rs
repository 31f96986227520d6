use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::commands::load_container;

/// Stream the output of a container until it exits
#[derive(Parser, Debug)]
pub struct Attach {
    #[clap(required = true)]
    pub container_id: String,
}

pub fn attach(args: Attach, root_path: PathBuf) -> Result<()> {
    let mut container = load_container(&root_path, &args.container_id)?;
    let copied = container.attach(&mut io::stdout().lock())?;
    tracing::debug!(bytes = copied, "container output closed");
    Ok(())
}
