//! Scratch directories owned by one build stage: a rootfs and a private tmp
//! dir for session files and host scripts.
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::unistd::{self, Gid, Uid};

use crate::cleanup::{CleanupHandle, CleanupList};
use crate::config::{BuildEnv, BuildOptions, OutputFormat};
use crate::definition::Definition;
use crate::mountinfo::{self, MountInfoError};

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("'noexec' mount option set on {0}, scripts cannot run from the build bundle")]
    NoExec(PathBuf),
    #[error("'noexec' mount option set on temporary directory {0}")]
    TmpNoExec(PathBuf),
    #[error("destination {0} has no usable parent directory")]
    NoParent(PathBuf),
    #[error("failed to create temporary directory in {path}: {err}")]
    TempDir { path: PathBuf, err: Errno },
    #[error("bundle io error on {path}: {err}")]
    Io { path: PathBuf, err: io::Error },
    #[error(transparent)]
    MountInfo(#[from] MountInfoError),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BundleError + '_ {
    move |err| BundleError::Io {
        path: path.to_path_buf(),
        err,
    }
}

#[derive(Debug)]
pub struct Bundle {
    rootfs: PathBuf,
    tmp_dir: PathBuf,
    /// `build-temp-*` directory holding the rootfs, absent when updating an
    /// existing sandbox in place.
    work_dir: Option<PathBuf>,
    copy_to: Option<PathBuf>,
    definition: Definition,
    opts: BuildOptions,
    cleanup: Option<(CleanupList, CleanupHandle)>,
}

impl Bundle {
    /// Creates the scratch directories for building `definition` towards
    /// `dest`. Sandbox builds place the rootfs next to the destination so the
    /// final step is a rename, unless that filesystem cannot hold ownership.
    #[tracing::instrument(level = "debug", skip(definition, opts, env))]
    pub fn new(
        dest: &Path,
        definition: Definition,
        opts: &BuildOptions,
        env: &BuildEnv,
    ) -> Result<Self, BundleError> {
        let tmp = env.tmp_dir();
        fs::create_dir_all(&tmp).map_err(io_err(&tmp))?;
        check_tmp_dir(&tmp)?;

        let mut copy_to = None;
        let parent = match opts.format {
            OutputFormat::Sif => tmp.clone(),
            OutputFormat::Sandbox => {
                let parent = absolute_parent(dest)?;
                if mountinfo::probe(&parent)?.noexec {
                    return Err(BundleError::NoExec(parent));
                }
                if can_chown(&parent)? {
                    parent
                } else {
                    tracing::warn!(
                        "{} does not support ownership changes, building under {} and copying to the destination",
                        parent.display(),
                        tmp.display()
                    );
                    copy_to = Some(dest.to_path_buf());
                    tmp.clone()
                }
            }
        };

        let work_dir = make_temp_dir(&parent, "build-temp-")?;
        let rootfs = work_dir.join("rootfs");
        let tmp_dir = match fs::create_dir(&rootfs)
            .and_then(|_| fs::set_permissions(&rootfs, fs::Permissions::from_mode(0o755)))
            .map_err(io_err(&rootfs))
            .and_then(|_| make_temp_dir(&tmp, "bundle-temp-"))
        {
            Ok(dir) => dir,
            Err(err) => {
                let _ = fs::remove_dir_all(&work_dir);
                return Err(err);
            }
        };
        tracing::debug!(rootfs = ?rootfs, tmp_dir = ?tmp_dir, "created build bundle");

        Ok(Self {
            rootfs,
            tmp_dir,
            work_dir: Some(work_dir),
            copy_to,
            definition,
            opts: opts.clone(),
            cleanup: None,
        })
    }

    /// Bundle whose rootfs is an existing sandbox updated in place.
    pub fn in_place(
        sandbox: &Path,
        definition: Definition,
        opts: &BuildOptions,
        env: &BuildEnv,
    ) -> Result<Self, BundleError> {
        let tmp = env.tmp_dir();
        check_tmp_dir(&tmp)?;
        if mountinfo::probe(sandbox)?.noexec {
            return Err(BundleError::NoExec(sandbox.to_path_buf()));
        }
        let tmp_dir = make_temp_dir(&tmp, "bundle-temp-")?;
        Ok(Self {
            rootfs: sandbox.to_path_buf(),
            tmp_dir,
            work_dir: None,
            copy_to: None,
            definition,
            opts: opts.clone(),
            cleanup: None,
        })
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn opts(&self) -> &BuildOptions {
        &self.opts
    }

    /// Destination the sandbox assembler must copy to instead of renaming.
    pub fn copy_to(&self) -> Option<&Path> {
        self.copy_to.as_deref()
    }

    pub fn is_in_place(&self) -> bool {
        self.work_dir.is_none()
    }

    pub fn run_section(&self, name: &str) -> bool {
        self.opts.sections.includes(name)
    }

    /// Registers removal of this bundle so an interrupted build still
    /// releases it.
    pub fn register(&mut self, cleanup: &CleanupList) {
        let paths = self.owned_paths();
        let no_cleanup = self.opts.no_cleanup;
        let handle = cleanup.push(format!("bundle {}", self.rootfs.display()), move || {
            remove_paths(&paths, no_cleanup)
        });
        self.cleanup = Some((cleanup.clone(), handle));
    }

    /// Removes the bundle directories. Safe to call more than once.
    pub fn remove(&mut self) {
        match self.cleanup.take() {
            Some((list, handle)) => list.release(handle),
            None => remove_paths(&self.owned_paths(), self.opts.no_cleanup),
        }
    }

    fn owned_paths(&self) -> Vec<PathBuf> {
        self.work_dir
            .iter()
            .cloned()
            .chain(std::iter::once(self.tmp_dir.clone()))
            .collect()
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        self.remove();
    }
}

fn remove_paths(paths: &[PathBuf], no_cleanup: bool) {
    let existing: Vec<&PathBuf> = paths.iter().filter(|p| p.exists()).collect();
    if existing.is_empty() {
        return;
    }
    if no_cleanup {
        let list: Vec<String> = existing.iter().map(|p| p.display().to_string()).collect();
        tracing::info!(
            "Build performed with no clean up option, build bundle(s) located at: {}",
            list.join(", ")
        );
        return;
    }
    for path in existing {
        tracing::debug!("removing {}", path.display());
        if let Err(err) = fs::remove_dir_all(path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::error!("could not remove {}: {err}", path.display());
            }
        }
    }
}

fn check_tmp_dir(tmp: &Path) -> Result<(), BundleError> {
    let flags = mountinfo::probe(tmp)?;
    if flags.noexec {
        return Err(BundleError::TmpNoExec(tmp.to_path_buf()));
    }
    if flags.nodev {
        tracing::warn!(
            "'nodev' mount option set on {}, it could be a source of failure during build process",
            flags.mount_point.display()
        );
    }
    Ok(())
}

fn absolute_parent(dest: &Path) -> Result<PathBuf, BundleError> {
    let dest = if dest.is_absolute() {
        dest.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(io_err(dest))?
            .join(dest)
    };
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| BundleError::NoParent(dest.clone()))?;
    fs::create_dir_all(parent).map_err(io_err(parent))?;
    Ok(parent.to_path_buf())
}

fn make_temp_dir(parent: &Path, prefix: &str) -> Result<PathBuf, BundleError> {
    unistd::mkdtemp(&parent.join(format!("{prefix}XXXXXX"))).map_err(|err| BundleError::TempDir {
        path: parent.to_path_buf(),
        err,
    })
}

/// Ownership can only be tested as root; unprivileged builds never chown.
fn can_chown(dir: &Path) -> Result<bool, BundleError> {
    if !Uid::effective().is_root() {
        return Ok(true);
    }
    let probe_dir = make_temp_dir(dir, ".chown-probe-")?;
    let probe = probe_dir.join(".chownTest");
    let result = fs::File::create(&probe)
        .map_err(io_err(&probe))
        .and_then(|_| {
            match unistd::chown(&probe, Some(Uid::from_raw(1)), Some(Gid::from_raw(1))) {
                Ok(()) => Ok(true),
                Err(Errno::EPERM) | Err(Errno::EINVAL) => Ok(false),
                Err(err) => Err(BundleError::Io {
                    path: probe.clone(),
                    err: err.into(),
                }),
            }
        });
    let _ = fs::remove_dir_all(&probe_dir);
    result
}
