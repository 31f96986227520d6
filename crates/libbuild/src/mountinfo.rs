//! Mount option checks for the directories a build writes to.
use std::path::{Path, PathBuf};

use procfs::process::{MountInfo, Process};
use procfs::ProcError;

#[derive(Debug, thiserror::Error)]
pub enum MountInfoError {
    #[error("failed to read mountinfo of the current process: {0}")]
    Read(#[source] ProcError),
    #[error("could not find the mount containing {0}")]
    NotFound(PathBuf),
}

/// The options that matter to a build for the mount holding a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountFlags {
    pub mount_point: PathBuf,
    pub noexec: bool,
    pub nodev: bool,
}

pub fn current_mounts() -> Result<Vec<MountInfo>, MountInfoError> {
    Ok(Process::myself()
        .map_err(MountInfoError::Read)?
        .mountinfo()
        .map_err(MountInfoError::Read)?
        .into_iter()
        .collect())
}

/// Finds the mount with the longest mount point that is a prefix of `path`.
pub fn find_parent_mount<'a>(path: &Path, mounts: &'a [MountInfo]) -> Option<&'a MountInfo> {
    mounts
        .iter()
        .filter(|mi| path.starts_with(&mi.mount_point))
        .max_by_key(|mi| mi.mount_point.as_os_str().len())
}

pub fn flags_for(path: &Path, mounts: &[MountInfo]) -> Result<MountFlags, MountInfoError> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mount =
        find_parent_mount(&path, mounts).ok_or_else(|| MountInfoError::NotFound(path.clone()))?;
    Ok(MountFlags {
        mount_point: mount.mount_point.clone(),
        noexec: mount.mount_options.contains_key("noexec"),
        nodev: mount.mount_options.contains_key("nodev"),
    })
}

/// Mount flags for `path` as seen by the current process.
pub fn probe(path: &Path) -> Result<MountFlags, MountInfoError> {
    flags_for(path, &current_mounts()?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) fn mount(id: i32, point: &str, options: &[&str]) -> MountInfo {
        MountInfo {
            mnt_id: id,
            pid: 1,
            majmin: "0:1".to_string(),
            root: "/".to_string(),
            mount_point: PathBuf::from(point),
            mount_options: options
                .iter()
                .map(|o| (o.to_string(), None))
                .collect::<HashMap<_, _>>(),
            opt_fields: vec![],
            fs_type: "ext4".to_string(),
            mount_source: Some("/dev/sda1".to_string()),
            super_options: Default::default(),
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mounts = vec![
            mount(1, "/", &["rw"]),
            mount(2, "/tmp", &["rw", "nodev"]),
            mount(3, "/tmpfoo", &["rw", "noexec"]),
        ];
        let found = find_parent_mount(Path::new("/tmp/build-temp-1/rootfs"), &mounts).unwrap();
        assert_eq!(found.mnt_id, 2);
        let found = find_parent_mount(Path::new("/var/lib"), &mounts).unwrap();
        assert_eq!(found.mnt_id, 1);
    }

    #[test]
    fn test_flags_for() -> anyhow::Result<()> {
        let mounts = vec![mount(1, "/", &["rw"]), mount(2, "/scratch", &["noexec", "nodev"])];
        let flags = flags_for(Path::new("/scratch/sifbox"), &mounts)?;
        assert_eq!(flags.mount_point, PathBuf::from("/scratch"));
        assert!(flags.noexec && flags.nodev);
        assert!(!flags_for(Path::new("/home"), &mounts)?.noexec);
        assert!(flags_for(Path::new("/home"), &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_mount_flags_of_current_process() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let flags = probe(tmp.path())?;
        assert!(tmp.path().canonicalize()?.starts_with(&flags.mount_point));
        Ok(())
    }
}
