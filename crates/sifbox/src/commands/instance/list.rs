use std::io;

use anyhow::Result;
use clap::Parser;
use libcontainer::instance::{render_json, render_table, APP_SUBDIR};

/// List running instances
#[derive(Parser, Debug)]
pub struct List {
    /// Print the list as JSON
    #[clap(short, long)]
    pub json: bool,
    /// Show the instances of another user, root only
    #[clap(short, long)]
    pub user: Option<String>,
    /// Only instances whose name matches this glob pattern
    #[clap(default_value = "*")]
    pub pattern: String,
}

pub fn list(args: List) -> Result<()> {
    let registry = crate::commands::registry(APP_SUBDIR, args.user.as_deref())?;
    let instances = registry.list(&args.pattern)?;
    if args.json {
        render_json(&instances, io::stdout())?;
    } else {
        render_table(&instances, io::stdout())?;
    }
    Ok(())
}
