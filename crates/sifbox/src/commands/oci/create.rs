//! Handles the creation of a new container
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libcontainer::container::{ContainerBuilder, DEFAULT_MONITOR_ARGS};
use libcontainer::instance::OCI_SUBDIR;

use crate::commands::{current_exe, registry};

/// Create a container from an OCI bundle
#[derive(Parser, Debug)]
pub struct Create {
    /// Path to the bundle directory, containing config.json and root filesystem
    #[clap(short, long, default_value = ".")]
    pub bundle: PathBuf,
    /// Name of the container instance to be started
    #[clap(required = true)]
    pub container_id: String,
}

/// Returns once the monitor reports the container as created.
pub fn create(args: Create, root_path: PathBuf) -> Result<()> {
    let monitor_args = DEFAULT_MONITOR_ARGS.iter().map(|a| a.to_string()).collect();
    let container = ContainerBuilder::new(&args.container_id, root_path, &args.bundle)
        .with_monitor(current_exe()?, monitor_args)
        .with_registry(registry(OCI_SUBDIR, None)?)
        .build()
        .with_context(|| format!("failed to create container {}", args.container_id))?;
    tracing::debug!(id = container.id(), "container created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_defaults_to_cwd() -> Result<()> {
        let args = Create::try_parse_from(["create", "c1"])?;
        assert_eq!(args.bundle, PathBuf::from("."));
        let args = Create::try_parse_from(["create", "-b", "/srv/bundle", "c1"])?;
        assert_eq!(args.bundle, PathBuf::from("/srv/bundle"));
        assert!(Create::try_parse_from(["create"]).is_err());
        Ok(())
    }
}
