//! Local image conveyor: a SIF file, a bare squashfs image or a sandbox
//! directory on the build host.
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use libsif::header::{LAUNCH_LEN, MAGIC};
use libsif::{FsType, Image, LoadMode};

use super::{BuildContext, SourceError};
use crate::bundle::Bundle;
use crate::fsutil::{self, Ownership};
use crate::squashfs;

#[derive(Debug)]
pub struct LocalConveyor {
    path: PathBuf,
}

impl LocalConveyor {
    pub fn new(src: &str) -> Self {
        Self {
            path: PathBuf::from(src),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[tracing::instrument(level = "debug", skip_all, fields(path = ?self.path))]
    pub fn get(&mut self, ctx: &BuildContext, bundle: &Bundle) -> Result<(), SourceError> {
        extract_local(&self.path, ctx, bundle)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LocalKind {
    Sandbox,
    Sif,
    Squashfs,
}

fn detect(path: &Path) -> Result<LocalKind, SourceError> {
    let meta = fs::metadata(path).map_err(SourceError::io(path))?;
    if meta.is_dir() {
        return Ok(LocalKind::Sandbox);
    }
    if !meta.is_file() {
        return Err(SourceError::UnknownLocalImage(path.to_path_buf()));
    }
    let mut head = [0u8; LAUNCH_LEN + MAGIC.len()];
    let mut file = File::open(path).map_err(SourceError::io(path))?;
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..]).map_err(SourceError::io(path))? {
            0 => break,
            n => filled += n,
        }
    }
    let head = &head[..filled];
    if head.starts_with(b"hsqs") {
        Ok(LocalKind::Squashfs)
    } else if head.get(LAUNCH_LEN..) == Some(&MAGIC[..]) {
        Ok(LocalKind::Sif)
    } else {
        Err(SourceError::UnknownLocalImage(path.to_path_buf()))
    }
}

/// Fills the bundle rootfs from an image file or sandbox directory.
pub(super) fn extract_local(path: &Path, ctx: &BuildContext, bundle: &Bundle) -> Result<(), SourceError> {
    match detect(path)? {
        LocalKind::Sandbox => {
            tracing::debug!("copying sandbox {} into bundle", path.display());
            fsutil::copy_contents(path, bundle.rootfs(), Ownership::Preserve)?;
        }
        LocalKind::Squashfs => {
            squashfs::unsquash(path, bundle.rootfs(), None, &ctx.cancel)?;
        }
        LocalKind::Sif => {
            let image = Image::load(path, LoadMode::ReadOnly)?;
            let primary = image.primary_partition()?;
            if matches!(primary.partition(), Some((FsType::EncryptedSquashfs, _, _))) {
                return Err(SourceError::EncryptedSource(path.to_path_buf()));
            }
            let id = primary.id;
            let squashfs = bundle.tmp_dir().join("source-rootfs.sqfs");
            let result = File::create(&squashfs)
                .map_err(SourceError::io(&squashfs))
                .and_then(|mut file| Ok(image.copy_data(id, &mut file)?))
                .and_then(|_| Ok(squashfs::unsquash(&squashfs, bundle.rootfs(), None, &ctx.cancel)?));
            let _ = fs::remove_file(&squashfs);
            result?;
        }
    }
    Ok(())
}
