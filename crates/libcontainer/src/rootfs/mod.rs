//! Preparing a root filesystem for a process about to exec: private mount
//! propagation, bind mounts and spec mounts below the rootfs, then the
//! change of root.
mod bind;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};
use nix::unistd;
use oci_spec::runtime::Mount as SpecMount;

pub use bind::BindPath;

#[derive(Debug, thiserror::Error)]
pub enum RootfsError {
    #[error("failed to mount {src:?} on {target}: {err}")]
    Mount {
        src: Option<PathBuf>,
        target: PathBuf,
        err: nix::Error,
    },
    #[error("failed to create mount point {path}: {err}")]
    MountPoint {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("mount destination {0} escapes the root filesystem")]
    Escape(PathBuf),
    #[error("failed to change root to {path}: {err}")]
    Chroot { path: PathBuf, err: nix::Error },
    #[error("failed to change directory to {path}: {err}")]
    Chdir { path: PathBuf, err: nix::Error },
    #[error("invalid bind path {0:?}")]
    InvalidBind(String),
}

type Result<T> = std::result::Result<T, RootfsError>;

/// Stops mounts made from here on leaking back to the parent namespace.
pub fn make_private() -> Result<()> {
    mount::<str, str, str, str>(None, "/", None, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None).map_err(
        |err| RootfsError::Mount {
            src: None,
            target: PathBuf::from("/"),
            err,
        },
    )
}

/// `dest` inside `rootfs`, refusing `..` components that would leave it.
pub fn join_in_root(rootfs: &Path, dest: &Path) -> Result<PathBuf> {
    let mut joined = rootfs.to_path_buf();
    for component in dest.components() {
        match component {
            std::path::Component::Normal(c) => joined.push(c),
            std::path::Component::ParentDir => return Err(RootfsError::Escape(dest.to_path_buf())),
            _ => {}
        }
    }
    Ok(joined)
}

/// Creates the target of a bind mount with the same kind as its source.
fn create_mount_point(source: &Path, target: &Path) -> Result<()> {
    let err = |err| RootfsError::MountPoint {
        path: target.to_path_buf(),
        err,
    };
    if target.exists() {
        return Ok(());
    }
    if source.is_dir() {
        fs::create_dir_all(target).map_err(err)
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(err)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(target)
            .map(drop)
            .map_err(err)
    }
}

pub fn bind_mount(source: &Path, target: &Path, readonly: bool) -> Result<()> {
    create_mount_point(source, target)?;
    tracing::debug!(?source, ?target, readonly, "bind mount");
    let mount_err = |err| RootfsError::Mount {
        src: Some(source.to_path_buf()),
        target: target.to_path_buf(),
        err,
    };
    mount::<Path, Path, str, str>(
        Some(source),
        target,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )
    .map_err(mount_err)?;
    if readonly {
        remount_readonly(target)?;
    }
    Ok(())
}

pub fn remount_readonly(target: &Path) -> Result<()> {
    mount::<str, Path, str, str>(
        None,
        target,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None,
    )
    .map_err(|err| RootfsError::Mount {
        src: None,
        target: target.to_path_buf(),
        err,
    })
}

/// Mount flags and leftover data options of a spec mount.
pub fn parse_mount_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        let (clear, flag) = match option.as_str() {
            "defaults" => (false, MsFlags::empty()),
            "ro" => (false, MsFlags::MS_RDONLY),
            "rw" => (true, MsFlags::MS_RDONLY),
            "suid" => (true, MsFlags::MS_NOSUID),
            "nosuid" => (false, MsFlags::MS_NOSUID),
            "dev" => (true, MsFlags::MS_NODEV),
            "nodev" => (false, MsFlags::MS_NODEV),
            "exec" => (true, MsFlags::MS_NOEXEC),
            "noexec" => (false, MsFlags::MS_NOEXEC),
            "sync" => (false, MsFlags::MS_SYNCHRONOUS),
            "async" => (true, MsFlags::MS_SYNCHRONOUS),
            "noatime" => (false, MsFlags::MS_NOATIME),
            "relatime" => (false, MsFlags::MS_RELATIME),
            "strictatime" => (false, MsFlags::MS_STRICTATIME),
            "bind" => (false, MsFlags::MS_BIND),
            "rbind" => (false, MsFlags::MS_BIND | MsFlags::MS_REC),
            "private" | "rprivate" | "shared" | "rshared" | "slave" | "rslave" => {
                (false, MsFlags::empty())
            }
            other => {
                data.push(other);
                continue;
            }
        };
        if clear {
            flags &= !flag;
        } else {
            flags |= flag;
        }
    }
    (flags, data.join(","))
}

/// Applies the mounts of a runtime spec below `rootfs`. A mount the host
/// refuses (e.g. `sysfs` without a network namespace) is skipped with a
/// warning so unprivileged containers still start.
pub fn mount_spec_mounts(rootfs: &Path, mounts: &[SpecMount]) -> Result<()> {
    for m in mounts {
        let target = join_in_root(rootfs, m.destination())?;
        let (flags, data) = parse_mount_options(m.options().as_deref().unwrap_or_default());
        let result = if flags.contains(MsFlags::MS_BIND) {
            match m.source() {
                Some(source) => bind_mount(source, &target, flags.contains(MsFlags::MS_RDONLY)),
                None => Err(RootfsError::InvalidBind(m.destination().display().to_string())),
            }
        } else {
            fs::create_dir_all(&target)
                .map_err(|err| RootfsError::MountPoint {
                    path: target.clone(),
                    err,
                })
                .and_then(|_| {
                    let data = (!data.is_empty()).then_some(data.as_str());
                    mount(
                        m.source().as_deref(),
                        &target,
                        m.typ().as_deref(),
                        flags,
                        data,
                    )
                    .map_err(|err| RootfsError::Mount {
                        src: m.source().clone(),
                        target: target.clone(),
                        err,
                    })
                })
        };
        if let Err(err) = result {
            tracing::warn!(destination = ?m.destination(), %err, "skipping mount");
        }
    }
    Ok(())
}

/// Changes root to `rootfs` and the working directory to `cwd` inside it.
pub fn enter(rootfs: &Path, cwd: &Path) -> Result<()> {
    unistd::chroot(rootfs).map_err(|err| RootfsError::Chroot {
        path: rootfs.to_path_buf(),
        err,
    })?;
    let cwd = if cwd.as_os_str().is_empty() {
        Path::new("/")
    } else {
        cwd
    };
    unistd::chdir(cwd).map_err(|err| RootfsError::Chdir {
        path: cwd.to_path_buf(),
        err,
    })
}
