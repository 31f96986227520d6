use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::Pid;

use super::blkio::{Blkio, V1BlkioStatsError};
use super::controller::Controller;
use super::cpu::Cpu;
use super::cpuacct::{CpuAcct, V1CpuAcctStatsError};
use super::freezer::{Freezer, V1FreezerControllerError};
use super::memory::{Memory, V1MemoryControllerError, V1MemoryStatsError};
use super::pids::Pids;
use super::util::{self, V1MountPointError};
use super::{ControllerType as CtrlType, CONTROLLERS};
use crate::common::{
    self, CgroupManager, ControllerOpt, FreezerState, JoinSafelyError, PathBufExt,
    WrappedIoError,
};
use crate::stats::{PidStatsError, Stats, StatsProvider};

#[derive(thiserror::Error, Debug)]
pub enum V1ManagerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("mount point lookup: {0}")]
    MountPoint(#[from] V1MountPointError),
    #[error("while joining paths: {0}")]
    JoinSafely(#[from] JoinSafelyError),
    #[error("cgroup {0} is required to fulfill the request, but is not supported by this system")]
    CGroupRequired(CtrlType),
    #[error("subsystem {0} does not exist")]
    SubsystemDoesNotExist(CtrlType),

    #[error(transparent)]
    FreezerController(#[from] V1FreezerControllerError),
    #[error(transparent)]
    MemoryController(#[from] V1MemoryControllerError),

    #[error("cpuacct stats: {0}")]
    CpuAcctStats(#[from] V1CpuAcctStatsError),
    #[error("memory stats: {0}")]
    MemoryStats(#[from] V1MemoryStatsError),
    #[error("blkio stats: {0}")]
    BlkioStats(#[from] V1BlkioStatsError),
    #[error("pid stats: {0}")]
    PidStats(#[from] PidStatsError),
}

pub struct Manager {
    subsystems: HashMap<CtrlType, PathBuf>,
}

impl Manager {
    /// Constructs a manager where `cgroup_path` is relative to the mount
    /// point of every subsystem.
    pub fn new(cgroup_path: &Path) -> Result<Self, V1ManagerError> {
        let mut subsystems = HashMap::new();
        for subsystem in CONTROLLERS {
            match util::get_subsystem_mount_point(subsystem) {
                Ok(mount_point) => {
                    subsystems.insert(*subsystem, mount_point.join_safely(cgroup_path)?);
                }
                Err(err) => tracing::warn!("cgroup {} not supported on this system: {}", subsystem, err),
            }
        }

        Ok(Manager { subsystems })
    }

    /// Constructs a manager from the `/proc/<pid>/cgroup` entries of a
    /// process. Each entry pairs the controllers of one hierarchy with the
    /// path of the process inside it.
    pub fn from_memberships(memberships: &[(Vec<String>, PathBuf)]) -> Result<Self, V1ManagerError> {
        let mut subsystems = HashMap::new();
        for subsystem in CONTROLLERS {
            let Some((_, path)) = memberships
                .iter()
                .find(|(controllers, _)| controllers.iter().any(|c| c == subsystem.as_ref()))
            else {
                continue;
            };

            match util::get_subsystem_mount_point(subsystem) {
                Ok(mount_point) => {
                    subsystems.insert(*subsystem, mount_point.join_safely(path)?);
                }
                Err(err) => tracing::debug!("skipping {}: {}", subsystem, err),
            }
        }

        Ok(Manager { subsystems })
    }

    #[cfg(test)]
    fn with_subsystems(subsystems: HashMap<CtrlType, PathBuf>) -> Self {
        Manager { subsystems }
    }

    fn get_required_controllers(
        &self,
        controller_opt: &ControllerOpt,
    ) -> Result<Vec<(CtrlType, &PathBuf)>, V1ManagerError> {
        let mut required = Vec::new();
        for controller in CONTROLLERS {
            let needed = match controller {
                CtrlType::Cpu => Cpu::needs_to_handle(controller_opt).is_some(),
                CtrlType::CpuAcct => CpuAcct::needs_to_handle(controller_opt).is_some(),
                CtrlType::Memory => Memory::needs_to_handle(controller_opt).is_some(),
                CtrlType::Pids => Pids::needs_to_handle(controller_opt).is_some(),
                CtrlType::Blkio => Blkio::needs_to_handle(controller_opt).is_some(),
                CtrlType::Freezer => Freezer::needs_to_handle(controller_opt).is_some(),
            };

            if needed {
                let path = self
                    .subsystems
                    .get(controller)
                    .ok_or(V1ManagerError::CGroupRequired(*controller))?;
                required.push((*controller, path));
            }
        }

        Ok(required)
    }
}

impl CgroupManager for Manager {
    type Error = V1ManagerError;

    fn add_task(&self, pid: Pid) -> Result<(), Self::Error> {
        for (subsystem, path) in &self.subsystems {
            match subsystem {
                CtrlType::Cpu => Cpu::add_task(pid, path)?,
                CtrlType::CpuAcct => CpuAcct::add_task(pid, path)?,
                CtrlType::Memory => Memory::add_task(pid, path)?,
                CtrlType::Pids => Pids::add_task(pid, path)?,
                CtrlType::Blkio => Blkio::add_task(pid, path)?,
                CtrlType::Freezer => Freezer::add_task(pid, path)?,
            }
        }

        Ok(())
    }

    fn apply(&self, controller_opt: &ControllerOpt) -> Result<(), Self::Error> {
        for (subsystem, path) in self.get_required_controllers(controller_opt)? {
            match subsystem {
                CtrlType::Cpu => Cpu::apply(controller_opt, path)?,
                CtrlType::CpuAcct => CpuAcct::apply(controller_opt, path)?,
                CtrlType::Memory => Memory::apply(controller_opt, path)?,
                CtrlType::Pids => Pids::apply(controller_opt, path)?,
                CtrlType::Blkio => Blkio::apply(controller_opt, path)?,
                CtrlType::Freezer => Freezer::apply(controller_opt, path)?,
            }
        }

        Ok(())
    }

    fn remove(&self) -> Result<(), Self::Error> {
        for path in self.subsystems.values() {
            if path.exists() {
                tracing::debug!("remove cgroup {:?}", path);
                common::kill_procs(path)?;
                common::delete_with_retry(path, 4, Duration::from_millis(100))?;
            }
        }

        Ok(())
    }

    fn freeze(&self, state: FreezerState) -> Result<(), Self::Error> {
        let path = self
            .subsystems
            .get(&CtrlType::Freezer)
            .ok_or(V1ManagerError::SubsystemDoesNotExist(CtrlType::Freezer))?;
        let controller_opt = ControllerOpt {
            resources: &Default::default(),
            freezer_state: Some(state),
        };
        Ok(Freezer::apply(&controller_opt, path)?)
    }

    fn stats(&self) -> Result<Stats, Self::Error> {
        let mut stats = Stats::default();
        for (subsystem, path) in &self.subsystems {
            match subsystem {
                CtrlType::CpuAcct => stats.cpu.usage = CpuAcct::stats(path)?,
                CtrlType::Memory => stats.memory = Memory::stats(path)?,
                CtrlType::Pids => stats.pids = Pids::stats(path)?,
                CtrlType::Blkio => stats.blkio = Blkio::stats(path)?,
                _ => continue,
            }
        }

        Ok(stats)
    }

    fn get_all_pids(&self) -> Result<Vec<Pid>, Self::Error> {
        // every task is in the pids hierarchy if the controller is mounted
        let path = self
            .subsystems
            .get(&CtrlType::Pids)
            .or_else(|| self.subsystems.get(&CtrlType::Freezer))
            .ok_or(V1ManagerError::SubsystemDoesNotExist(CtrlType::Pids))?;
        Ok(common::get_all_pids(path)?)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use oci_spec::runtime::{LinuxPidsBuilder, LinuxResourcesBuilder};

    use super::*;
    use crate::test::set_fixture;

    #[test]
    fn test_apply_without_required_subsystem() {
        let manager = Manager::with_subsystems(HashMap::new());
        let resources = LinuxResourcesBuilder::default()
            .pids(LinuxPidsBuilder::default().limit(5).build().unwrap())
            .build()
            .unwrap();
        let result = manager.apply(&ControllerOpt {
            resources: &resources,
            freezer_state: None,
        });
        assert!(matches!(
            result,
            Err(V1ManagerError::CGroupRequired(CtrlType::Pids))
        ));
    }

    #[test]
    fn test_apply_and_stats_through_subsystems() {
        let tmp = tempfile::tempdir().unwrap();
        let pids = tmp.path().join("pids");
        fs::create_dir_all(&pids).unwrap();
        set_fixture(&pids, "pids.max", "").unwrap();
        set_fixture(&pids, "pids.current", "2").unwrap();

        let manager = Manager::with_subsystems(HashMap::from([(CtrlType::Pids, pids.clone())]));
        let resources = LinuxResourcesBuilder::default()
            .pids(LinuxPidsBuilder::default().limit(64).build().unwrap())
            .build()
            .unwrap();
        manager
            .apply(&ControllerOpt {
                resources: &resources,
                freezer_state: None,
            })
            .unwrap();

        let stats = manager.stats().unwrap();
        assert_eq!(stats.pids.current, 2);
        assert_eq!(stats.pids.limit, 64);
    }

    #[test]
    fn test_freeze_without_freezer() {
        let manager = Manager::with_subsystems(HashMap::new());
        assert!(matches!(
            manager.freeze(FreezerState::Frozen),
            Err(V1ManagerError::SubsystemDoesNotExist(CtrlType::Freezer))
        ));
    }
}
