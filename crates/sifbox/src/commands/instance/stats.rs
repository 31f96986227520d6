use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use clap::Parser;
use libcontainer::instance::APP_SUBDIR;
use libcontainer::stats::{self, StatsCollector};
use nix::unistd::Pid;

/// Show the resource usage of running instances
#[derive(Parser, Debug)]
pub struct Stats {
    /// Print one JSON sample instead of a live view
    #[clap(short, long)]
    pub json: bool,
    /// Look at the instances of another user, root only
    #[clap(short, long)]
    pub user: Option<String>,
    /// Instance names or glob patterns
    #[clap(required = true)]
    pub names: Vec<String>,
}

pub fn stats(args: Stats) -> Result<()> {
    let registry = crate::commands::registry(APP_SUBDIR, args.user.as_deref())?;
    let mut collectors = Vec::new();
    for pattern in &args.names {
        let instances = registry.list(pattern)?;
        if instances.is_empty() {
            bail!("no instance found with name {pattern}");
        }
        for instance in instances {
            let collector = StatsCollector::for_pid(&instance.name, Pid::from_raw(instance.pid))
                .with_context(|| format!("no cgroup found for instance {}", instance.name))?;
            collectors.push(collector);
        }
    }

    if args.json {
        let samples = stats::snapshot(&mut collectors)?;
        let mut stdout = io::stdout();
        serde_json::to_writer_pretty(&mut stdout, &samples)?;
        writeln!(stdout)?;
        return Ok(());
    }
    stats::watch(&mut collectors, io::stdout(), None)?;
    Ok(())
}
