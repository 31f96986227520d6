//! Tree copies that keep symlinks, permissions and, when allowed, ownership.
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
#[error("failed to copy {src} to {dst}: {err}")]
pub struct CopyError {
    pub src: PathBuf,
    pub dst: PathBuf,
    #[source]
    pub err: io::Error,
}

/// Ownership handling for copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Try to keep the source owner, warning once on failure.
    Preserve,
    Ignore,
}

struct Copier {
    ownership: Ownership,
    chown_warned: bool,
    /// Directory modes applied once their contents are written.
    dir_modes: Vec<(PathBuf, u32)>,
}

impl Copier {
    fn copy_one(&mut self, src: &Path, dst: &Path) -> io::Result<()> {
        let meta = fs::symlink_metadata(src)?;
        let ft = meta.file_type();
        if ft.is_symlink() {
            let target = fs::read_link(src)?;
            if fs::symlink_metadata(dst).is_ok() {
                remove_any(dst)?;
            }
            std::os::unix::fs::symlink(target, dst)?;
        } else if ft.is_dir() {
            match fs::create_dir(dst) {
                Err(err) if err.kind() != io::ErrorKind::AlreadyExists => return Err(err),
                _ => {}
            }
            let mode = meta.mode() & 0o7777;
            fs::set_permissions(dst, fs::Permissions::from_mode(mode | 0o700))?;
            self.dir_modes.push((dst.to_path_buf(), mode));
        } else if ft.is_file() {
            // never write through a link planted at the destination
            match fs::symlink_metadata(dst) {
                Ok(m) if m.is_dir() => fs::remove_dir_all(dst)?,
                Ok(m) if m.file_type().is_symlink() => fs::remove_file(dst)?,
                _ => {}
            }
            fs::copy(src, dst)?;
            fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        } else {
            tracing::debug!("skipping special file {}", src.display());
            return Ok(());
        }
        self.chown(dst, &meta);
        Ok(())
    }

    fn chown(&mut self, dst: &Path, meta: &fs::Metadata) {
        if self.ownership == Ownership::Ignore {
            return;
        }
        if meta.uid() == Uid::effective().as_raw() && meta.gid() == Gid::effective().as_raw() {
            return;
        }
        let res = fchownat(
            None,
            dst,
            Some(Uid::from_raw(meta.uid())),
            Some(Gid::from_raw(meta.gid())),
            FchownatFlags::NoFollowSymlink,
        );
        if let Err(err) = res {
            if !self.chown_warned {
                tracing::warn!(
                    "could not preserve ownership of {} ({err}), files will be owned by the current user",
                    dst.display()
                );
                self.chown_warned = true;
            }
        }
    }
}

fn remove_any(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copies `src` (file, symlink or directory tree) to `dst`. Symlinks are
/// copied as links, never followed.
pub fn copy_tree(src: &Path, dst: &Path, ownership: Ownership) -> Result<(), CopyError> {
    let wrap = |err| CopyError {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        err,
    };
    let mut copier = Copier {
        ownership,
        chown_warned: false,
        dir_modes: Vec::new(),
    };
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|err| wrap(err.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| wrap(io::Error::new(io::ErrorKind::Other, err)))?;
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };
        copier.copy_one(entry.path(), &target).map_err(|err| CopyError {
            src: entry.path().to_path_buf(),
            dst: target.clone(),
            err,
        })?;
    }
    for (dir, mode) in copier.dir_modes.iter().rev() {
        fs::set_permissions(dir, fs::Permissions::from_mode(*mode)).map_err(|err| CopyError {
            src: src.to_path_buf(),
            dst: dir.clone(),
            err,
        })?;
    }
    Ok(())
}

/// Copies the contents of directory `src` into existing directory `dst`.
pub fn copy_contents(src: &Path, dst: &Path, ownership: Ownership) -> Result<(), CopyError> {
    let entries = fs::read_dir(src).map_err(|err| CopyError {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        err,
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| CopyError {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            err,
        })?;
        copy_tree(&entry.path(), &dst.join(entry.file_name()), ownership)?;
    }
    Ok(())
}

/// Gives the owner write access on directories and read/write on files so a
/// sandbox can be modified and removed by its owner.
pub fn fix_perms(root: &Path) -> io::Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let meta = entry.path().symlink_metadata()?;
        let extra = if meta.is_dir() {
            0o700
        } else if meta.is_file() {
            0o600
        } else {
            continue;
        };
        let mode = meta.mode() & 0o7777;
        if mode & extra != extra {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | extra))?;
        }
    }
    Ok(())
}

/// Creates an empty regular file (and its parents) if nothing exists at
/// `path`. Returns whether it was created.
pub fn ensure_file(path: &Path) -> io::Result<bool> {
    if fs::symlink_metadata(path).is_ok() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_tree_keeps_links_and_modes() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("bin"))?;
        fs::write(src.join("bin/tool"), b"#!/bin/sh\n")?;
        fs::set_permissions(src.join("bin/tool"), fs::Permissions::from_mode(0o750))?;
        std::os::unix::fs::symlink("bin/tool", src.join("tool"))?;

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst, Ownership::Preserve)?;
        assert_eq!(fs::read(dst.join("bin/tool"))?, b"#!/bin/sh\n");
        assert_eq!(
            fs::metadata(dst.join("bin/tool"))?.permissions().mode() & 0o777,
            0o750
        );
        assert_eq!(fs::read_link(dst.join("tool"))?, PathBuf::from("bin/tool"));
        Ok(())
    }

    #[test]
    fn test_copy_single_file_over_existing() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("a");
        let dst = tmp.path().join("b");
        fs::write(&src, b"new")?;
        fs::write(&dst, b"old")?;
        copy_tree(&src, &dst, Ownership::Ignore)?;
        assert_eq!(fs::read(&dst)?, b"new");
        Ok(())
    }

    #[test]
    fn test_copy_contents() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(src.join("etc"))?;
        fs::write(src.join("etc/os-release"), b"ID=test")?;
        fs::create_dir_all(&dst)?;
        copy_contents(&src, &dst, Ownership::Preserve)?;
        assert!(dst.join("etc/os-release").is_file());
        Ok(())
    }

    #[test]
    fn test_fix_perms() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("ro");
        fs::create_dir(&dir)?;
        fs::write(dir.join("file"), b"x")?;
        fs::set_permissions(dir.join("file"), fs::Permissions::from_mode(0o444))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o555))?;
        fix_perms(&dir)?;
        assert_eq!(fs::metadata(&dir)?.permissions().mode() & 0o777, 0o755);
        assert_eq!(fs::metadata(dir.join("file"))?.permissions().mode() & 0o777, 0o644);
        Ok(())
    }

    #[test]
    fn test_ensure_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("etc/hosts");
        assert!(ensure_file(&path)?);
        assert!(!ensure_file(&path)?);
        assert!(path.is_file());
        Ok(())
    }
}
