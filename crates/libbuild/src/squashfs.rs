//! Wrappers around the squashfs tools used to pack and unpack root
//! filesystems.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::Uid;
use once_cell::sync::OnceCell;

use crate::cancel::CancelToken;
use crate::command::{self, CommandError};
use crate::config::BuildEnv;

/// Offset of the compressor id in the squashfs superblock.
const COMPRESSION_OFFSET: u64 = 20;
const GZIP_COMPRESSION: u16 = 1;
const FALLBACK_DIRS: [&str; 2] = ["/usr/sbin", "/sbin"];

#[derive(Debug, thiserror::Error)]
pub enum SquashfsError {
    #[error("{0} not found in the configured path, $PATH, /usr/sbin or /sbin")]
    NotFound(&'static str),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("squashfs io error on {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },
    #[error("{path} is not a squashfs image")]
    NotSquashfs { path: PathBuf },
    #[error("mksquashfs cannot produce gzip compressed images (compressor id {0})")]
    NoGzip(u16),
}

/// Locates `name`: explicit path first, then `$PATH`, then the sbin
/// directories that are often missing from unprivileged users' `$PATH`.
pub fn find_tool(name: &'static str, configured: Option<&Path>) -> Result<PathBuf, SquashfsError> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        tracing::warn!("configured {name} {} does not exist", path.display());
    }
    if let Ok(path) = which::which(name) {
        return Ok(path);
    }
    FALLBACK_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|p| p.is_file())
        .ok_or(SquashfsError::NotFound(name))
}

/// Compressor id recorded in a squashfs superblock.
pub fn compression_of(image: &Path) -> Result<u16, SquashfsError> {
    let wrap = |err| SquashfsError::Io {
        path: image.to_path_buf(),
        err,
    };
    let mut file = File::open(image).map_err(wrap)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).map_err(wrap)?;
    if &magic != b"hsqs" {
        return Err(SquashfsError::NotSquashfs {
            path: image.to_path_buf(),
        });
    }
    file.seek(SeekFrom::Start(COMPRESSION_OFFSET)).map_err(wrap)?;
    let mut id = [0u8; 2];
    file.read_exact(&mut id).map_err(wrap)?;
    Ok(u16::from_le_bytes(id))
}

#[derive(Debug)]
pub struct Mksquashfs {
    path: PathBuf,
    procs: Option<u32>,
    mem: Option<String>,
    all_root: bool,
    gzip_args: OnceCell<Vec<String>>,
}

impl Mksquashfs {
    pub fn from_env(env: &BuildEnv) -> Result<Self, SquashfsError> {
        let path = find_tool("mksquashfs", env.mksquashfs_path.as_deref())?;
        Ok(Self {
            path,
            procs: env.mksquashfs_procs,
            mem: env.mksquashfs_mem.clone(),
            all_root: !Uid::effective().is_root(),
            gzip_args: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arguments forcing gzip, empty when gzip is already the default.
    /// Probed once by building a tiny image.
    fn gzip_args(&self, scratch: &Path, cancel: &CancelToken) -> Result<&[String], SquashfsError> {
        if let Some(args) = self.gzip_args.get() {
            return Ok(args);
        }
        let src = scratch.join(".squashfs-probe-src");
        let img = scratch.join(".squashfs-probe.img");
        std::fs::create_dir_all(&src).map_err(|err| SquashfsError::Io {
            path: src.clone(),
            err,
        })?;
        let probe = |extra: &[&str]| -> Result<u16, SquashfsError> {
            command::output(
                Command::new(&self.path)
                    .arg(&src)
                    .arg(&img)
                    .arg("-noappend")
                    .args(extra),
                cancel,
            )?;
            compression_of(&img)
        };

        let result = probe(&[]).and_then(|id| {
            if id == GZIP_COMPRESSION {
                return Ok(Vec::new());
            }
            tracing::debug!("mksquashfs default compressor is {id}, forcing gzip");
            match probe(&["-comp", "gzip"])? {
                GZIP_COMPRESSION => Ok(vec!["-comp".to_owned(), "gzip".to_owned()]),
                other => Err(SquashfsError::NoGzip(other)),
            }
        });
        let _ = std::fs::remove_dir_all(&src);
        let _ = std::fs::remove_file(&img);
        let args = result?;
        Ok(self.gzip_args.get_or_init(|| args))
    }

    pub fn args(&self, src: &Path, dest: &Path, gzip: &[String]) -> Vec<String> {
        let mut args = vec![
            src.to_string_lossy().into_owned(),
            dest.to_string_lossy().into_owned(),
            "-noappend".to_owned(),
        ];
        args.extend(gzip.iter().cloned());
        if self.all_root {
            args.push("-all-root".to_owned());
        }
        if let Some(mem) = &self.mem {
            args.push("-mem".to_owned());
            args.push(mem.clone());
        }
        if let Some(procs) = self.procs {
            args.push("-processors".to_owned());
            args.push(procs.to_string());
        }
        args
    }

    /// Packs `src` into a gzip compressed squashfs image at `dest`.
    #[tracing::instrument(level = "debug", skip(self, cancel))]
    pub fn create(
        &self,
        src: &Path,
        dest: &Path,
        scratch: &Path,
        cancel: &CancelToken,
    ) -> Result<(), SquashfsError> {
        let gzip = self.gzip_args(scratch, cancel)?.to_vec();
        let args = self.args(src, dest, &gzip);
        command::output(Command::new(&self.path).args(&args), cancel)?;
        Ok(())
    }
}

/// Extracts the squashfs image at `image` into `dest`, which may exist.
pub fn unsquash(
    image: &Path,
    dest: &Path,
    configured: Option<&Path>,
    cancel: &CancelToken,
) -> Result<(), SquashfsError> {
    let unsquashfs = find_tool("unsquashfs", configured)?;
    let mut cmd = Command::new(unsquashfs);
    cmd.arg("-f").arg("-d").arg(dest);
    if !Uid::effective().is_root() {
        // xattrs other than user.* cannot be set unprivileged
        cmd.args(["-user-xattrs"]);
    }
    cmd.arg(image);
    command::output(&mut cmd, cancel)?;
    Ok(())
}
