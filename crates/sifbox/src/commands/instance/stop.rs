use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use libcontainer::instance::{stop_many, InstanceFile, StopOptions, StopOutcome, APP_SUBDIR};
use libcontainer::signal::Signal;

/// Stop named instances
#[derive(Parser, Debug)]
pub struct Stop {
    /// Stop every instance of the user
    #[clap(short, long)]
    pub all: bool,
    /// Signal sent to the instances, by name or number
    #[clap(short, long, default_value = "SIGTERM")]
    pub signal: String,
    /// Seconds to wait before the instances are killed
    #[clap(short, long, default_value_t = 10)]
    pub timeout: u64,
    /// Kill the instances right away
    #[clap(short = 'F', long)]
    pub force: bool,
    /// Stop the instances of another user, root only
    #[clap(short, long)]
    pub user: Option<String>,
    /// Names or glob patterns of the instances
    #[clap(required_unless_present = "all", conflicts_with = "all")]
    pub names: Vec<String>,
}

impl Stop {
    fn options(&self) -> Result<StopOptions> {
        let signal = Signal::try_from(self.signal.as_str())?;
        Ok(StopOptions {
            signal: signal.into_raw(),
            timeout: Duration::from_secs(self.timeout),
            force: self.force,
        })
    }
}

/// Every pattern has to match at least one instance. Instances matched by
/// several patterns are stopped once.
fn select<F>(patterns: &[String], mut list: F) -> Result<Vec<InstanceFile>>
where
    F: FnMut(&str) -> Result<Vec<InstanceFile>>,
{
    let mut selected = BTreeMap::new();
    for pattern in patterns {
        let matched = list(pattern)?;
        if matched.is_empty() {
            bail!("no instance found with name {pattern}");
        }
        for instance in matched {
            selected.insert(instance.name.clone(), instance);
        }
    }
    Ok(selected.into_values().collect())
}

pub fn stop(args: Stop) -> Result<()> {
    let opts = args.options()?;
    let registry = crate::commands::registry(APP_SUBDIR, args.user.as_deref())?;
    let patterns = if args.all {
        vec!["*".to_owned()]
    } else {
        args.names.clone()
    };
    let instances = select(&patterns, |pattern| Ok(registry.list(pattern)?))?;
    if instances.is_empty() {
        eprintln!("No instance found");
        return Ok(());
    }

    for instance in &instances {
        eprintln!(
            "Stopping {} instance of {} (PID={})",
            instance.name, instance.image, instance.pid
        );
    }
    let mut failed = Vec::new();
    for (name, result) in stop_many(&registry, &instances, &opts) {
        match result {
            Ok(StopOutcome::Stopped) => tracing::debug!("instance {name} stopped"),
            Ok(StopOutcome::Killed) => tracing::debug!("instance {name} killed"),
            Err(err) => {
                tracing::error!("failed to stop instance {name}: {err}");
                failed.push(name);
            }
        }
    }
    if !failed.is_empty() {
        bail!("failed to stop instance(s): {}", failed.join(", "));
    }
    Ok(())
}
