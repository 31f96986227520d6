use std::path::{Path, PathBuf};
use std::{fs, io};

use anyhow::{Context, Result};
use clap::Parser;
use oci_spec::runtime::{LinuxPidsBuilder, LinuxResources, LinuxResourcesBuilder};

use crate::commands::load_container;

/// Update the resource limits of a container
#[derive(Parser, Debug)]
pub struct Update {
    /// Read the new resources from a JSON file, `-` for stdin
    #[clap(short, long)]
    pub resources: Option<PathBuf>,
    /// Maximum number of processes
    #[clap(long)]
    pub pids_limit: Option<i64>,
    #[clap(required = true)]
    pub container_id: String,
}

fn read_resources(path: &Path) -> Result<LinuxResources> {
    let resources = if path == Path::new("-") {
        serde_json::from_reader(io::stdin())?
    } else {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        serde_json::from_reader(io::BufReader::new(file))?
    };
    Ok(resources)
}

fn resources(args: &Update) -> Result<LinuxResources> {
    if let Some(path) = &args.resources {
        return read_resources(path);
    }
    let mut builder = LinuxResourcesBuilder::default();
    if let Some(limit) = args.pids_limit {
        builder = builder.pids(LinuxPidsBuilder::default().limit(limit).build()?);
    }
    Ok(builder.build()?)
}

pub fn update(args: Update, root_path: PathBuf) -> Result<()> {
    let resources = resources(&args)?;
    let mut container = load_container(&root_path, &args.container_id)?;
    container
        .update(&resources)
        .with_context(|| format!("failed to update container {}", args.container_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resources_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"memory": {{"limit": 1048576}}, "pids": {{"limit": 16}}}}"#)?;
        let path = file.path().to_string_lossy().into_owned();
        let args = Update::try_parse_from(["update", "-r", &path, "c1"])?;
        let res = resources(&args)?;
        assert_eq!(res.memory().as_ref().and_then(|m| m.limit()), Some(1048576));
        assert_eq!(res.pids().as_ref().map(|p| p.limit()), Some(16));
        Ok(())
    }

    #[test]
    fn test_pids_limit_flag() -> Result<()> {
        let args = Update::try_parse_from(["update", "--pids-limit", "32", "c1"])?;
        let res = resources(&args)?;
        assert_eq!(res.pids().as_ref().map(|p| p.limit()), Some(32));
        assert!(res.memory().is_none());
        Ok(())
    }
}
