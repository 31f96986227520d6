use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use libcgroups::common::{AnyCgroupManager, CgroupConfig};
use nix::fcntl::{Flock, FlockArg};
use nix::unistd::{Pid, Uid};
use oci_spec::runtime::Spec;

use crate::config::EngineConfig;
use crate::container::{ContainerStatus, State};
use crate::error::LibcontainerError;
use crate::utils;

pub const ATTACH_FILE: &str = "attach.sock";
pub const CONTROL_FILE: &str = "control.sock";
pub const LOG_FILE: &str = "container.log";
const LOCK_FILE: &str = "state.lock";

/// Structure representing the container data
#[derive(Debug, Clone)]
pub struct Container {
    // State of the container
    pub state: State,
    // indicated the directory for the root path in the container
    pub root: PathBuf,
}

/// Exclusive hold on a container's lock file. Lifecycle transitions take it
/// so two commands never interleave their state updates.
pub struct ContainerLock(#[allow(dead_code)] Flock<File>);

/// Container IDs become directory and socket names.
pub fn validate_id(id: &str) -> Result<(), LibcontainerError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id.len() <= 1024
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'));
    if valid {
        Ok(())
    } else {
        Err(LibcontainerError::InvalidInput(format!(
            "invalid container id {id:?}"
        )))
    }
}

impl Container {
    pub fn new(
        container_id: &str,
        status: ContainerStatus,
        pid: Option<i32>,
        bundle: &Path,
        container_root: &Path,
    ) -> Result<Self, LibcontainerError> {
        let container_root = fs::canonicalize(container_root).map_err(|err| {
            LibcontainerError::InvalidInput(format!(
                "invalid container root {container_root:?}: {err:?}"
            ))
        })?;
        let bundle = fs::canonicalize(bundle).map_err(|err| {
            LibcontainerError::InvalidInput(format!("invalid bundle {bundle:?}: {err:?}"))
        })?;
        let state = State::new(container_id, status, pid, bundle);

        Ok(Self {
            state,
            root: container_root,
        })
    }

    /// Loads the container `id` kept under the runtime `root_path`.
    pub fn load_by_id(root_path: &Path, id: &str) -> Result<Self, LibcontainerError> {
        validate_id(id)?;
        let container_root = root_path.join(id);
        if !State::file_path(&container_root).exists() {
            return Err(LibcontainerError::NotFound(id.to_owned()));
        }
        Self::load(container_root)
    }

    pub fn load(container_root: PathBuf) -> Result<Self, LibcontainerError> {
        let state = State::load(&container_root)?;
        let mut container = Self {
            state,
            root: container_root,
        };
        container.refresh_status()?;
        Ok(container)
    }

    pub fn save(&self) -> Result<(), LibcontainerError> {
        tracing::debug!("Save container status: {:?} in {:?}", self, self.root);
        self.state.save(&self.root)?;
        Ok(())
    }

    /// Re-reads the state written by other processes (the monitor in
    /// particular) while keeping the lock held.
    pub fn reload(&mut self) -> Result<(), LibcontainerError> {
        self.state = State::load(&self.root)?;
        self.refresh_status()
    }

    pub fn lock(&self) -> Result<ContainerLock, LibcontainerError> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(LibcontainerError::io(&path))?;
        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| errno)?;
        Ok(ContainerLock(lock))
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn can_start(&self) -> bool {
        self.state.status.can_start()
    }

    pub fn can_kill(&self) -> bool {
        self.state.status.can_kill()
    }

    pub fn can_delete(&self) -> bool {
        self.state.status.can_delete()
    }

    pub fn can_exec(&self) -> bool {
        self.state.status.can_exec()
    }

    pub fn can_pause(&self) -> bool {
        self.state.status.can_pause()
    }

    pub fn can_resume(&self) -> bool {
        self.state.status.can_resume()
    }

    pub(crate) fn incorrect_status(&self, op: &'static str) -> LibcontainerError {
        tracing::error!(status = ?self.status(), id = ?self.id(), "cannot {op} container");
        LibcontainerError::IncorrectStatus {
            id: self.id().to_owned(),
            status: self.status(),
            op,
        }
    }

    pub fn bundle(&self) -> &PathBuf {
        &self.state.bundle
    }

    pub fn pid(&self) -> Option<Pid> {
        self.state.pid.map(Pid::from_raw)
    }

    pub fn set_pid(&mut self, pid: i32) -> &mut Self {
        self.state.pid = Some(pid);
        self
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.state.created
    }

    pub fn creator(&self) -> Option<String> {
        self.state
            .creator
            .and_then(|uid| utils::get_unix_user(Uid::from_raw(uid)))
            .map(|user| user.name)
    }

    pub fn set_creator(&mut self, uid: u32) -> &mut Self {
        self.state.creator = Some(uid);
        self
    }

    pub fn status(&self) -> ContainerStatus {
        self.state.status
    }

    pub fn set_status(&mut self, status: ContainerStatus) -> &mut Self {
        let created = match (status, self.state.created) {
            (ContainerStatus::Created, None) => Some(Utc::now()),
            _ => self.state.created,
        };

        self.state.created = created;
        self.state.status = status;

        self
    }

    /// Marks the container stopped when its process is gone but nobody
    /// recorded the exit.
    pub fn refresh_status(&mut self) -> Result<(), LibcontainerError> {
        let alive_status = matches!(
            self.status(),
            ContainerStatus::Created | ContainerStatus::Running | ContainerStatus::Paused
        );
        if let Some(pid) = self.pid() {
            if alive_status && !utils::process_alive(pid) {
                self.set_status(ContainerStatus::Stopped);
            }
        }
        Ok(())
    }

    pub fn config(&self) -> Result<EngineConfig, LibcontainerError> {
        Ok(EngineConfig::load(&self.root)?)
    }

    /// The runtime spec from the bundle the container was created from.
    pub fn spec(&self) -> Result<Spec, LibcontainerError> {
        Ok(Spec::load(self.bundle().join("config.json"))?)
    }

    pub fn start_socket_path(&self) -> PathBuf {
        self.root.join(crate::start_socket::START_FILE)
    }

    pub fn attach_socket_path(&self) -> PathBuf {
        self.root.join(ATTACH_FILE)
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.root.join(CONTROL_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub(crate) fn cgroup_manager(&self) -> Result<AnyCgroupManager, LibcontainerError> {
        let cgroup_path = self
            .config()?
            .cgroup_path
            .ok_or_else(|| LibcontainerError::NoCgroup(self.id().to_owned()))?;
        Ok(libcgroups::common::create_cgroup_manager(CgroupConfig {
            cgroup_path,
            container_name: self.id().to_owned(),
        })?)
    }
}
