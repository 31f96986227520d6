//! Per stage copies of the host name resolution files, bound over the
//! container's own during `%post` and `%test`.
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{access, AccessFlags};

use super::StageError;
use crate::bundle::Bundle;

const HOST_RESOLV: &str = "/etc/resolv.conf";
const HOST_HOSTS: &str = "/etc/hosts";

/// Staged files, removed when dropped.
#[derive(Debug, Default)]
pub struct SessionFiles {
    pub resolv: Option<PathBuf>,
    pub hosts: Option<PathBuf>,
}

impl SessionFiles {
    pub fn create(bundle: &Bundle) -> Result<Self, StageError> {
        Self::create_from(bundle, Path::new(HOST_RESOLV), Path::new(HOST_HOSTS))
    }

    fn create_from(bundle: &Bundle, resolv: &Path, hosts: &Path) -> Result<Self, StageError> {
        let mut files = Self::default();
        files.resolv = stage_file(bundle, resolv, HOST_RESOLV, "Name resolution could fail")?;
        files.hosts = stage_file(bundle, hosts, HOST_HOSTS, "Host resolution could fail")?;
        Ok(files)
    }

    /// `-B src:dst` pairs for the re-executed command line.
    pub fn bind_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (file, point) in [(&self.resolv, HOST_RESOLV), (&self.hosts, HOST_HOSTS)] {
            if let Some(file) = file {
                args.push("-B".to_owned());
                args.push(format!("{}:{point}", file.display()));
            }
        }
        args
    }
}

impl Drop for SessionFiles {
    fn drop(&mut self) {
        for file in [self.resolv.take(), self.hosts.take()].into_iter().flatten() {
            let _ = fs::remove_file(file);
        }
    }
}

/// Copies `source` into the bundle tmp dir with a trailing newline. Returns
/// `None` with a warning when the container has no readable file to bind
/// over at `point`.
fn stage_file(bundle: &Bundle, source: &Path, point: &str, warning: &str) -> Result<Option<PathBuf>, StageError> {
    let dest = bundle.rootfs().join(point.trim_start_matches('/'));
    if let Err(err) = access(&dest, AccessFlags::R_OK) {
        tracing::warn!("{warning}: while accessing to {}: {err}", dest.display());
        return Ok(None);
    }
    let mut content = match fs::read(source) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("{warning}: {} does not exist on the host", source.display());
            return Ok(None);
        }
        Err(err) => return Err(StageError::io(source)(err)),
    };
    // differs from the distribution default so package managers leave the
    // bound file alone
    content.push(b'\n');

    let name = source.file_name().unwrap_or(source.as_os_str());
    let staged = bundle.tmp_dir().join(name);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(&staged)
        .map_err(StageError::io(&staged))?;
    file.write_all(&content).map_err(StageError::io(&staged))?;
    Ok(Some(staged))
}
