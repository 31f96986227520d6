use std::path::PathBuf;

use procfs::process::{MountInfo, Process};
use procfs::ProcError;

use super::ControllerType;

#[derive(thiserror::Error, Debug)]
pub enum V1MountPointError {
    #[error("failed to read process info from /proc/self: {0}")]
    ReadSelf(ProcError),
    #[error("failed to get mountinfo: {0}")]
    MountInfo(ProcError),
    #[error("could not find mountpoint for {subsystem}")]
    NotFound { subsystem: ControllerType },
}

fn cgroup_mounts() -> Result<Vec<MountInfo>, V1MountPointError> {
    Ok(Process::myself()
        .map_err(V1MountPointError::ReadSelf)?
        .mountinfo()
        .map_err(V1MountPointError::MountInfo)?
        .into_iter()
        .filter(|m| m.fs_type == "cgroup")
        .collect())
}

/// Finds the hierarchy a v1 subsystem is mounted on. cpu and cpuacct are
/// frequently co-mounted as `cpu,cpuacct`.
pub fn get_subsystem_mount_point(subsystem: &ControllerType) -> Result<PathBuf, V1MountPointError> {
    let name = subsystem.as_ref();
    cgroup_mounts()?
        .into_iter()
        .find(|m| {
            m.super_options.contains_key(name)
                || m.mount_point
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.split(',').any(|part| part == name))
                    .unwrap_or(false)
        })
        .map(|m| m.mount_point)
        .ok_or(V1MountPointError::NotFound {
            subsystem: *subsystem,
        })
}
