use std::path::{Path, PathBuf};

use crate::common::{self, WrappedIoError};

pub const CGROUP_CONTROLLERS: &str = "cgroup.controllers";
pub const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";

/// Controllers the manager knows how to drive.
pub const SUPPORTED_CONTROLLERS: &[&str] = &["cpu", "io", "memory", "pids"];

#[derive(thiserror::Error, Debug)]
pub enum V2UtilError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("cannot get available controllers. {0} does not exist")]
    DoesNotExist(PathBuf),
}

/// Reads `{root_path}/cgroup.controllers` and keeps the controllers this crate
/// supports.
pub fn get_available_controllers<P: AsRef<Path>>(root_path: P) -> Result<Vec<String>, V2UtilError> {
    let controllers_path = root_path.as_ref().join(CGROUP_CONTROLLERS);
    if !controllers_path.exists() {
        return Err(V2UtilError::DoesNotExist(controllers_path));
    }

    let mut controllers = Vec::new();
    for controller in common::read_cgroup_file(&controllers_path)?.split_whitespace() {
        if SUPPORTED_CONTROLLERS.contains(&controller) {
            controllers.push(controller.to_owned());
        } else {
            tracing::trace!("controller {} is not handled", controller);
        }
    }

    Ok(controllers)
}
