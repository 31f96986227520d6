use std::fs::{self, File};
use std::io::{self, Cursor};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use libsif::{Arch, DataType, DescriptorInput, FsType, Image, PartType, SifError, DEFAULT_GROUP};
use nix::unistd::{Gid, Uid};

use super::{check_destination, AssembleError};
use crate::bundle::Bundle;
use crate::cancel::CancelToken;
use crate::command;
use crate::config::BuildEnv;
use crate::sources::base_env::LABELS_FILE;
use crate::sources::BuildContext;
use crate::squashfs::{find_tool, Mksquashfs};

const MIB: u64 = 1024 * 1024;
const EMPTY_LABELS: &[u8] = b"{}\n";

/// Packs a rootfs into a squashfs primary partition wrapped in an image
/// file.
#[derive(Debug)]
pub struct SifAssembler {
    mksquashfs: Mksquashfs,
}

impl SifAssembler {
    pub fn from_env(env: &BuildEnv) -> Result<Self, AssembleError> {
        Ok(Self {
            mksquashfs: Mksquashfs::from_env(env)?,
        })
    }

    pub(super) fn assemble(
        &self,
        ctx: &BuildContext,
        bundle: &Bundle,
        dest: &Path,
        recipe_raw: &str,
    ) -> Result<(), AssembleError> {
        tracing::info!("Creating SIF file...");
        let rootfs = bundle.rootfs();
        let squashfs = bundle.tmp_dir().join("squashfs.img");
        self.mksquashfs
            .create(rootfs, &squashfs, bundle.tmp_dir(), &ctx.cancel)?;

        let labels_path = rootfs.join(LABELS_FILE);
        let labels = match fs::read(&labels_path) {
            Ok(labels) => labels,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => EMPTY_LABELS.to_vec(),
            Err(err) => return Err(AssembleError::io(labels_path)(err)),
        };

        let overlay = match bundle.opts().writable_overlay_mib {
            Some(mib) => Some(create_overlay(bundle.tmp_dir(), mib, &ctx.cancel)?),
            None => None,
        };

        ctx.cancel.check()?;
        check_destination(dest, bundle.opts().force)?;
        let result = write_image(dest, &squashfs, &labels, overlay.as_deref(), recipe_raw);
        let _ = fs::remove_file(&squashfs);
        if let Some(overlay) = &overlay {
            let _ = fs::remove_file(overlay);
        }
        result
    }
}

/// Creates `dest` exclusively and fills it. Only a file created here is
/// removed again on failure.
fn write_image(
    dest: &Path,
    squashfs: &Path,
    labels: &[u8],
    overlay: Option<&Path>,
    recipe_raw: &str,
) -> Result<(), AssembleError> {
    let image = Image::create_new(dest).map_err(|err| match err {
        SifError::Create { err, .. } if err.kind() == io::ErrorKind::AlreadyExists => {
            AssembleError::DestinationExists(dest.to_path_buf())
        }
        err => err.into(),
    })?;
    let result = fill_image(image, squashfs, labels, overlay, recipe_raw);
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

fn fill_image(
    mut image: Image,
    squashfs: &Path,
    labels: &[u8],
    overlay: Option<&Path>,
    recipe_raw: &str,
) -> Result<(), AssembleError> {
    let rootfs = File::open(squashfs).map_err(AssembleError::io(squashfs))?;
    let id = image.add_object(
        DescriptorInput::new(DataType::Partition, rootfs)
            .name("rootfs")
            .group(DEFAULT_GROUP)
            .partition(FsType::Squashfs, PartType::Primary, Arch::host()),
    )?;
    tracing::debug!(id, "added primary partition");

    image.add_object(
        DescriptorInput::new(DataType::GenericJson, Cursor::new(labels))
            .name("labels.json")
            .group(DEFAULT_GROUP),
    )?;

    if let Some(overlay) = overlay {
        let ext3 = File::open(overlay).map_err(AssembleError::io(overlay))?;
        image.add_overlay(ext3)?;
    }

    image.add_object(
        DescriptorInput::new(DataType::Deffile, Cursor::new(recipe_raw.as_bytes())).group(DEFAULT_GROUP),
    )?;
    Ok(())
}

/// Creates an ext3 image of `mib` MiB holding the empty `upper` and `work`
/// directories of an overlay layout.
fn create_overlay(scratch: &Path, mib: u64, cancel: &CancelToken) -> Result<PathBuf, AssembleError> {
    let len = mib.checked_mul(MIB).ok_or(AssembleError::OverlaySize(mib))?;
    let mkfs = find_tool("mkfs.ext3", None)?;
    let layout = scratch.join("overlay");
    for dir in ["upper", "work"] {
        let dir = layout.join(dir);
        fs::create_dir_all(&dir).map_err(AssembleError::io(&dir))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).map_err(AssembleError::io(&dir))?;
    }

    let image = scratch.join("overlay.img");
    let file = File::create(&image).map_err(AssembleError::io(&image))?;
    file.set_len(len).map_err(AssembleError::io(&image))?;
    drop(file);

    let mut cmd = Command::new(mkfs);
    cmd.arg("-F").args(overlay_owner_args()).arg("-d").arg(&layout).arg(&image);
    let result = command::output(&mut cmd, cancel).map_err(AssembleError::Overlay);
    let _ = fs::remove_dir_all(&layout);
    result?;
    Ok(image)
}

/// Unprivileged builds hand the overlay root to the calling user.
fn overlay_owner_args() -> Vec<String> {
    let uid = Uid::effective();
    if uid.is_root() {
        return Vec::new();
    }
    vec![
        "-E".to_owned(),
        format!("root_owner={}:{}", uid, Gid::effective()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsif::LoadMode;

    #[test]
    fn test_write_image_descriptor_order() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let squashfs = tmp.path().join("squashfs.img");
        fs::write(&squashfs, b"hsqs-fake")?;
        let overlay = tmp.path().join("overlay.img");
        fs::write(&overlay, vec![0u8; 4096])?;
        let dest = tmp.path().join("out.sif");

        write_image(&dest, &squashfs, b"{\"a\":\"b\"}", Some(&overlay), "Bootstrap: scratch\n")?;

        let image = Image::load(&dest, LoadMode::ReadOnly)?;
        let kinds: Vec<DataType> = image.descriptors().map(|d| d.data_type).collect();
        assert_eq!(
            kinds,
            vec![
                DataType::Partition,
                DataType::GenericJson,
                DataType::Partition,
                DataType::Deffile
            ]
        );
        let primary = image.primary_partition()?;
        assert_eq!(image.read_data(primary.id)?, b"hsqs-fake");
        assert!(image.has_overlay());
        let deffile = image.descriptors().last().unwrap();
        assert_eq!(image.read_data(deffile.id)?, b"Bootstrap: scratch\n");
        Ok(())
    }

    #[test]
    fn test_write_image_leaves_foreign_destination() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let squashfs = tmp.path().join("squashfs.img");
        fs::write(&squashfs, b"hsqs-fake")?;
        let dest = tmp.path().join("out.sif");
        fs::write(&dest, b"created by someone else")?;

        assert!(matches!(
            write_image(&dest, &squashfs, EMPTY_LABELS, None, ""),
            Err(AssembleError::DestinationExists(_))
        ));
        assert_eq!(fs::read(&dest)?, b"created by someone else");
        Ok(())
    }

    #[test]
    fn test_write_image_removes_partial_output() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dest = tmp.path().join("out.sif");
        let missing = tmp.path().join("missing.img");

        assert!(matches!(
            write_image(&dest, &missing, EMPTY_LABELS, None, ""),
            Err(AssembleError::Io { .. })
        ));
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn test_overlay_size_overflow() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(matches!(
            create_overlay(tmp.path(), u64::MAX / 1024, &CancelToken::new()),
            Err(AssembleError::OverlaySize(_))
        ));
        assert!(!tmp.path().join("overlay.img").exists());
        Ok(())
    }

    #[test]
    fn test_overlay_owner_args() {
        let args = overlay_owner_args();
        if Uid::effective().is_root() {
            assert!(args.is_empty());
        } else {
            assert_eq!(args[0], "-E");
            assert!(args[1].starts_with("root_owner="));
        }
    }
}
