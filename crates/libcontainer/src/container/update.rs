use libcgroups::common::{CgroupManager, ControllerOpt};
use oci_spec::runtime::LinuxResources;

use super::Container;
use crate::error::LibcontainerError;

impl Container {
    /// Applies new resource limits to the cgroup the container process
    /// currently lives in.
    #[tracing::instrument(level = "debug", skip(self, resources), fields(id = %self.id()))]
    pub fn update(&mut self, resources: &LinuxResources) -> Result<(), LibcontainerError> {
        let _lock = self.lock()?;
        self.reload()?;
        if !self.can_kill() {
            return Err(self.incorrect_status("update"));
        }
        let pid = self.pid().ok_or_else(|| {
            LibcontainerError::InvalidInput(format!("container {} has no process", self.id()))
        })?;

        let manager = libcgroups::common::create_cgroup_manager_for_pid(pid)?;
        manager.apply(&ControllerOpt {
            resources,
            freezer_state: None,
        })?;
        tracing::debug!(%pid, "resources updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerStatus;
    use anyhow::Result;
    use std::fs;

    #[test]
    fn test_update_stopped_container() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("c1");
        fs::create_dir_all(&root)?;
        let mut container = Container::new("c1", ContainerStatus::Stopped, None, tmp.path(), &root)?;
        container.save()?;
        let err = container.update(&LinuxResources::default()).unwrap_err();
        assert!(matches!(err, LibcontainerError::IncorrectStatus { op: "update", .. }));
        Ok(())
    }
}
