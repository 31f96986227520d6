use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Component::RootDir, Path, PathBuf},
    time::Duration,
};

use nix::unistd::Pid;

use super::{
    controller::Controller,
    cpu::Cpu,
    freezer::{Freezer, V2FreezerError},
    io::{Io, V2IoStatsError},
    memory::{Memory, V2MemoryControllerError, V2MemoryStatsError},
    pids::Pids,
    util::{self, V2UtilError, CGROUP_SUBTREE_CONTROL},
};
use crate::{
    common::{
        self, CgroupManager, ControllerOpt, FreezerState, JoinSafelyError, PathBufExt,
        WrapIoResult, WrappedIoError, CGROUP_PROCS,
    },
    stats::{ParseFlatKeyedDataError, PidStatsError, Stats, StatsProvider},
};

pub const CGROUP_KILL: &str = "cgroup.kill";

#[derive(thiserror::Error, Debug)]
pub enum V2ManagerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("while joining paths: {0}")]
    JoinSafely(#[from] JoinSafelyError),
    #[error(transparent)]
    Util(#[from] V2UtilError),
    #[error(transparent)]
    Freezer(#[from] V2FreezerError),
    #[error(transparent)]
    Memory(#[from] V2MemoryControllerError),
    #[error("cpu stats: {0}")]
    CpuStats(#[from] ParseFlatKeyedDataError),
    #[error("memory stats: {0}")]
    MemoryStats(#[from] V2MemoryStatsError),
    #[error("io stats: {0}")]
    IoStats(#[from] V2IoStatsError),
    #[error("pid stats: {0}")]
    PidStats(#[from] PidStatsError),
}

pub struct Manager {
    root_path: PathBuf,
    cgroup_path: PathBuf,
    full_path: PathBuf,
}

impl Manager {
    /// Constructs a new cgroup manager with root path being the mount point
    /// of a cgroup v2 fs and cgroup path being a relative path from the root
    pub fn new(root_path: PathBuf, cgroup_path: PathBuf) -> Result<Self, V2ManagerError> {
        let full_path = root_path.join_safely(&cgroup_path)?;

        Ok(Self {
            root_path,
            cgroup_path,
            full_path,
        })
    }

    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    fn create_unified_cgroup(&self, pid: Pid) -> Result<(), V2ManagerError> {
        let controllers: Vec<String> = util::get_available_controllers(&self.root_path)?
            .iter()
            .map(|c| format!("+{c}"))
            .collect();

        Self::write_controllers(&self.root_path, &controllers)?;

        let mut current_path = self.root_path.clone();
        let mut components = self
            .cgroup_path
            .components()
            .filter(|c| c.ne(&RootDir))
            .peekable();
        while let Some(component) = components.next() {
            current_path = current_path.join(component);
            if !current_path.exists() {
                fs::create_dir(&current_path).wrap_create_dir(&current_path)?;
                fs::set_permissions(&current_path, fs::Permissions::from_mode(0o755))
                    .wrap_other(&current_path)?;
            }

            // controllers can only be delegated from inner nodes
            if components.peek().is_some() {
                Self::write_controllers(&current_path, &controllers)?;
            }
        }

        common::write_cgroup_file(self.full_path.join(CGROUP_PROCS), pid)?;
        Ok(())
    }

    fn write_controllers(path: &Path, controllers: &[String]) -> Result<(), WrappedIoError> {
        for controller in controllers {
            common::write_cgroup_file_str(path.join(CGROUP_SUBTREE_CONTROL), controller)?;
        }

        Ok(())
    }
}

impl CgroupManager for Manager {
    type Error = V2ManagerError;

    fn add_task(&self, pid: Pid) -> Result<(), Self::Error> {
        self.create_unified_cgroup(pid)
    }

    fn apply(&self, controller_opt: &ControllerOpt) -> Result<(), Self::Error> {
        Cpu::apply(controller_opt, &self.full_path)?;
        Io::apply(controller_opt, &self.full_path)?;
        Memory::apply(controller_opt, &self.full_path)?;
        Pids::apply(controller_opt, &self.full_path)?;
        Freezer::apply(controller_opt, &self.full_path)?;

        Ok(())
    }

    fn remove(&self) -> Result<(), Self::Error> {
        if !self.full_path.exists() {
            return Ok(());
        }

        tracing::debug!("remove cgroup {:?}", self.full_path);
        let kill_file = self.full_path.join(CGROUP_KILL);
        if kill_file.exists() {
            common::write_cgroup_file_str(&kill_file, "1")?;
        } else {
            common::kill_procs(&self.full_path)?;
        }

        common::delete_with_retry(&self.full_path, 4, Duration::from_millis(100))?;
        Ok(())
    }

    fn freeze(&self, state: FreezerState) -> Result<(), Self::Error> {
        let controller_opt = ControllerOpt {
            resources: &Default::default(),
            freezer_state: Some(state),
        };
        Ok(Freezer::apply(&controller_opt, &self.full_path)?)
    }

    fn stats(&self) -> Result<Stats, Self::Error> {
        let mut stats = Stats::default();
        let available = util::get_available_controllers(&self.full_path).unwrap_or_else(|_| {
            util::SUPPORTED_CONTROLLERS
                .iter()
                .map(|c| c.to_string())
                .collect()
        });

        for controller in available {
            match controller.as_str() {
                "cpu" => stats.cpu.usage = Cpu::stats(&self.full_path)?,
                "memory" => stats.memory = Memory::stats(&self.full_path)?,
                "io" => stats.blkio = Io::stats(&self.full_path)?,
                "pids" => stats.pids = Pids::stats(&self.full_path)?,
                _ => continue,
            }
        }

        Ok(stats)
    }

    fn get_all_pids(&self) -> Result<Vec<Pid>, Self::Error> {
        Ok(common::get_all_pids(&self.full_path)?)
    }
}
