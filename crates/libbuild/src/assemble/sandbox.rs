use std::fs;
use std::path::Path;

use super::{check_destination, AssembleError};
use crate::bundle::Bundle;
use crate::fsutil::{self, Ownership};

/// Moves the bundle rootfs to `dest`, copying when the bundle lives on
/// another filesystem. A bundle updated in place is already there.
pub(super) fn assemble(bundle: &Bundle, dest: &Path) -> Result<(), AssembleError> {
    let rootfs = bundle.rootfs();
    if bundle.opts().fix_perms {
        tracing::debug!("making {} owner writable", rootfs.display());
        fsutil::fix_perms(rootfs).map_err(AssembleError::io(rootfs))?;
    }
    if bundle.is_in_place() {
        tracing::debug!("sandbox {} updated in place", rootfs.display());
        return Ok(());
    }
    check_destination(dest, bundle.opts().force)?;

    if bundle.copy_to().is_some() {
        return copy(rootfs, dest);
    }
    tracing::debug!("Moving sandbox from {} to {}", rootfs.display(), dest.display());
    match fs::rename(rootfs, dest) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(nix::libc::EXDEV) => copy(rootfs, dest),
        Err(err) => Err(AssembleError::io(dest)(err)),
    }
}

fn copy(rootfs: &Path, dest: &Path) -> Result<(), AssembleError> {
    tracing::debug!("Copying sandbox from {} to {}", rootfs.display(), dest.display());
    fs::create_dir_all(dest).map_err(AssembleError::io(dest))?;
    fsutil::copy_contents(rootfs, dest, Ownership::Preserve)?;
    Ok(())
}
