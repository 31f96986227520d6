//! Turns the last stage's bundle into the requested output: a single image
//! file or a sandbox directory.
mod sandbox;
mod sif;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use libsif::SifError;

use crate::bundle::Bundle;
use crate::cancel::Cancelled;
use crate::command::CommandError;
use crate::config::{BuildEnv, OutputFormat};
use crate::fsutil::CopyError;
use crate::sources::BuildContext;
use crate::squashfs::SquashfsError;

pub use sif::SifAssembler;

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("build target {0} already exists, use --force to overwrite it")]
    DestinationExists(PathBuf),
    #[error("assemble io error on {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("writable overlay of {0} MiB is too large")]
    OverlaySize(u64),
    #[error("failed to create writable overlay: {0}")]
    Overlay(#[source] CommandError),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error(transparent)]
    Squashfs(#[from] SquashfsError),
    #[error(transparent)]
    Sif(#[from] SifError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl AssembleError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> AssembleError {
        let path = path.into();
        move |err| AssembleError::Io { path, err }
    }
}

#[derive(Debug)]
pub enum Assembler {
    Sif(SifAssembler),
    Sandbox,
}

impl Assembler {
    pub fn for_format(format: OutputFormat, env: &BuildEnv) -> Result<Self, AssembleError> {
        Ok(match format {
            OutputFormat::Sif => Assembler::Sif(SifAssembler::from_env(env)?),
            OutputFormat::Sandbox => Assembler::Sandbox,
        })
    }

    /// Writes the bundle to `dest`. `recipe_raw` is recorded in the image
    /// as its definition file.
    #[tracing::instrument(level = "debug", skip(self, ctx, bundle, recipe_raw))]
    pub fn assemble(
        &self,
        ctx: &BuildContext,
        bundle: &Bundle,
        dest: &Path,
        recipe_raw: &str,
    ) -> Result<(), AssembleError> {
        ctx.cancel.check()?;
        match self {
            Assembler::Sif(sif) => sif.assemble(ctx, bundle, dest, recipe_raw),
            Assembler::Sandbox => sandbox::assemble(bundle, dest),
        }
    }
}

/// Removes an existing destination when `force` is set.
pub fn check_destination(dest: &Path, force: bool) -> Result<(), AssembleError> {
    let meta = match fs::symlink_metadata(dest) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(AssembleError::io(dest)(err)),
    };
    if !force {
        return Err(AssembleError::DestinationExists(dest.to_path_buf()));
    }
    tracing::warn!("Build target {} already exists and will be replaced", dest.display());
    let result = if meta.is_dir() {
        fs::remove_dir_all(dest)
    } else {
        fs::remove_file(dest)
    };
    result.map_err(AssembleError::io(dest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_destination() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("out.sif");
        check_destination(&dest, false)?;

        fs::write(&dest, "old")?;
        assert!(matches!(
            check_destination(&dest, false),
            Err(AssembleError::DestinationExists(_))
        ));
        check_destination(&dest, true)?;
        assert!(!dest.exists());

        let dir = tmp.path().join("sandbox");
        fs::create_dir_all(dir.join("etc"))?;
        check_destination(&dir, true)?;
        assert!(!dir.exists());
        Ok(())
    }
}
