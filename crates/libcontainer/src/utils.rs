//! Utility functionality

use std::collections::HashMap;
use std::fs::{self, DirBuilder};
use std::io::Write;
use std::os::linux::fs::MetadataExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::{Pid, Uid, User};
use procfs::process::{ProcState, Process};

pub fn parse_env(envs: &[String]) -> HashMap<String, String> {
    envs.iter()
        .filter_map(|e| {
            e.split_once('=')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
        })
        .collect()
}

/// Get a nix::unistd::User via UID. Potential errors will be ignored.
pub fn get_unix_user(uid: Uid) -> Option<User> {
    User::from_uid(uid).ok().flatten()
}

/// Name of the calling user, the numeric uid when it has no passwd entry.
pub fn current_user_name() -> String {
    let uid = Uid::current();
    get_unix_user(uid)
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string())
}

pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

#[derive(Debug, thiserror::Error)]
pub enum MkdirWithModeError {
    #[error("IO error")]
    Io(#[from] std::io::Error),
    #[error("metadata doesn't match the expected attributes")]
    MetadataMismatch,
}

/// Creates the specified directory and all parent directories with the specified mode. Ensures
/// that the directory has been created with the correct mode and that the owner of the directory
/// is the owner that has been specified
/// # Example
/// ``` no_run
/// use libcontainer::utils::create_dir_all_with_mode;
/// use nix::sys::stat::Mode;
/// use std::path::Path;
///
/// let path = Path::new("/tmp/sifbox");
/// create_dir_all_with_mode(&path, 1000, Mode::S_IRWXU).unwrap();
/// assert!(path.exists())
/// ```
pub fn create_dir_all_with_mode<P: AsRef<Path>>(
    path: P,
    owner: u32,
    mode: Mode,
) -> Result<(), MkdirWithModeError> {
    let path = path.as_ref();
    if !path.exists() {
        DirBuilder::new()
            .recursive(true)
            .mode(mode.bits())
            .create(path)?;
    }

    let metadata = path.metadata()?;
    if metadata.is_dir()
        && metadata.st_uid() == owner
        && metadata.st_mode() & mode.bits() == mode.bits()
    {
        Ok(())
    } else {
        Err(MkdirWithModeError::MetadataMismatch)
    }
}

pub fn is_in_new_userns() -> bool {
    match fs::read_to_string("/proc/self/uid_map") {
        Ok(content) => !content.contains("4294967295"),
        Err(err) => {
            tracing::warn!(%err, "failed to read /proc/self/uid_map");
            false
        }
    }
}

/// Checks if rootless mode needs to be used
pub fn rootless_required() -> bool {
    if !nix::unistd::geteuid().is_root() {
        return true;
    }
    is_in_new_userns()
}

/// True while `pid` exists and has not exited. Zombies count as gone since
/// nothing will run in them again.
pub fn process_alive(pid: Pid) -> bool {
    match Process::new(pid.as_raw()).and_then(|p| p.stat()) {
        Ok(stat) => !matches!(stat.state(), Ok(ProcState::Zombie | ProcState::Dead)),
        Err(_) => false,
    }
}

/// Writes `data` next to `path` and renames it over, so readers never see
/// a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_parse_env() {
        let env = parse_env(&[
            "PATH=/usr/bin:/bin".to_owned(),
            "EMPTY=".to_owned(),
            "EQ=a=b".to_owned(),
            "NOVALUE".to_owned(),
        ]);
        assert_eq!(env["PATH"], "/usr/bin:/bin");
        assert_eq!(env["EMPTY"], "");
        assert_eq!(env["EQ"], "a=b");
        assert!(!env.contains_key("NOVALUE"));
    }

    #[test]
    fn test_create_dir_all_with_mode() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("a/b");
        let uid = Uid::current().as_raw();
        create_dir_all_with_mode(&path, uid, Mode::S_IRWXU)?;
        assert!(path.is_dir());
        assert!(matches!(
            create_dir_all_with_mode(&path, uid.wrapping_add(1), Mode::S_IRWXU),
            Err(MkdirWithModeError::MetadataMismatch)
        ));
        Ok(())
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(Pid::this()));
        assert!(!process_alive(Pid::from_raw(i32::MAX)));
    }

    #[test]
    fn test_write_atomic() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("record.json");
        write_atomic(&path, b"one")?;
        write_atomic(&path, b"two")?;
        assert_eq!(fs::read_to_string(&path)?, "two");
        assert_eq!(fs::read_dir(tmp.path())?.count(), 1);
        Ok(())
    }
}
