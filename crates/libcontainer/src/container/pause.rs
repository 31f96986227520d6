use libcgroups::common::{CgroupManager, FreezerState};

use super::{Container, ContainerStatus};
use crate::error::LibcontainerError;

impl Container {
    /// Suspends all processes within the container
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id()))]
    pub fn pause(&mut self) -> Result<(), LibcontainerError> {
        let _lock = self.lock()?;
        self.reload()?;
        if !self.can_pause() {
            return Err(self.incorrect_status("pause"));
        }

        self.cgroup_manager()?.freeze(FreezerState::Frozen)?;
        tracing::debug!("saving paused status");
        self.set_status(ContainerStatus::Paused).save()?;
        Ok(())
    }

    /// Resumes all processes within a paused container
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id()))]
    pub fn resume(&mut self) -> Result<(), LibcontainerError> {
        let _lock = self.lock()?;
        self.reload()?;
        if !self.can_resume() {
            return Err(self.incorrect_status("resume"));
        }

        self.cgroup_manager()?.freeze(FreezerState::Thawed)?;
        tracing::debug!("saving running status");
        self.set_status(ContainerStatus::Running).save()?;
        Ok(())
    }
}
