use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf, StripPrefixError},
    time::Duration,
};

use nix::{
    sys::statfs::{statfs, CGROUP2_SUPER_MAGIC, TMPFS_MAGIC},
    unistd::Pid,
};
use oci_spec::runtime::LinuxResources;
use procfs::process::Process;

use super::stats::Stats;
use super::v1;
use super::v2;

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

pub trait CgroupManager {
    type Error;

    /// Adds a task specified by its pid to the cgroup
    fn add_task(&self, pid: Pid) -> Result<(), Self::Error>;

    /// Applies resource restrictions to the cgroup
    fn apply(&self, controller_opt: &ControllerOpt) -> Result<(), Self::Error>;

    /// Removes the cgroup, killing whatever is left inside
    fn remove(&self) -> Result<(), Self::Error>;

    /// Sets the freezer cgroup to the specified state
    fn freeze(&self, state: FreezerState) -> Result<(), Self::Error>;

    /// Retrieve statistics for the cgroup
    fn stats(&self) -> Result<Stats, Self::Error>;

    /// Gets the PIDs inside the cgroup
    fn get_all_pids(&self) -> Result<Vec<Pid>, Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum AnyManagerError {
    #[error(transparent)]
    V1(#[from] v1::manager::V1ManagerError),
    #[error(transparent)]
    V2(#[from] v2::manager::V2ManagerError),
}

pub enum AnyCgroupManager {
    V1(v1::manager::Manager),
    V2(v2::manager::Manager),
}

impl CgroupManager for AnyCgroupManager {
    type Error = AnyManagerError;

    fn add_task(&self, pid: Pid) -> Result<(), Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.add_task(pid)?),
            AnyCgroupManager::V2(m) => Ok(m.add_task(pid)?),
        }
    }

    fn apply(&self, controller_opt: &ControllerOpt) -> Result<(), Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.apply(controller_opt)?),
            AnyCgroupManager::V2(m) => Ok(m.apply(controller_opt)?),
        }
    }

    fn remove(&self) -> Result<(), Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.remove()?),
            AnyCgroupManager::V2(m) => Ok(m.remove()?),
        }
    }

    fn freeze(&self, state: FreezerState) -> Result<(), Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.freeze(state)?),
            AnyCgroupManager::V2(m) => Ok(m.freeze(state)?),
        }
    }

    fn stats(&self) -> Result<Stats, Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.stats()?),
            AnyCgroupManager::V2(m) => Ok(m.stats()?),
        }
    }

    fn get_all_pids(&self) -> Result<Vec<Pid>, Self::Error> {
        match self {
            AnyCgroupManager::V1(m) => Ok(m.get_all_pids()?),
            AnyCgroupManager::V2(m) => Ok(m.get_all_pids()?),
        }
    }
}

/// Layout of the cgroup filesystem on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupSetup {
    Hybrid,
    Legacy,
    Unified,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FreezerState {
    /// The freezer reported a state in between, or none at all.
    Undefined,
    Frozen,
    Thawed,
}

/// Options handed to every controller when a manager applies a change.
#[derive(Clone, Debug)]
pub struct ControllerOpt<'a> {
    /// Resource limits following the OCI Linux resources schema.
    pub resources: &'a LinuxResources,
    /// Requested freezer transition, if any.
    pub freezer_state: Option<FreezerState>,
}

#[derive(thiserror::Error, Debug)]
pub enum WrappedIoError {
    #[error("failed to open {path}: {err}")]
    Open { err: std::io::Error, path: PathBuf },
    #[error("failed to write {data} to {path}: {err}")]
    Write {
        err: std::io::Error,
        path: PathBuf,
        data: String,
    },
    #[error("failed to read {path}: {err}")]
    Read { err: std::io::Error, path: PathBuf },
    #[error("failed to create dir {path}: {err}")]
    CreateDir { err: std::io::Error, path: PathBuf },
    #[error("at {path}: {err}")]
    Other { err: std::io::Error, path: PathBuf },
}

pub(crate) trait WrapIoResult {
    type Target;

    fn wrap_create_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_read<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_write<P: Into<PathBuf>, D: Into<String>>(
        self,
        path: P,
        data: D,
    ) -> Result<Self::Target, WrappedIoError>;
    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
}

impl<T> WrapIoResult for Result<T, std::io::Error> {
    type Target = T;

    fn wrap_create_dir<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::CreateDir {
            err,
            path: path.into(),
        })
    }

    fn wrap_read<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Read {
            err,
            path: path.into(),
        })
    }

    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Open {
            err,
            path: path.into(),
        })
    }

    fn wrap_write<P: Into<PathBuf>, D: Into<String>>(
        self,
        path: P,
        data: D,
    ) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Write {
            err,
            path: path.into(),
            data: data.into(),
        })
    }

    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Other {
            err,
            path: path.into(),
        })
    }
}

/// Writes one value into an existing control file. Control files are never
/// created, a missing one means the controller is not enabled.
pub fn write_cgroup_file_str<P: AsRef<Path>>(path: P, data: &str) -> Result<(), WrappedIoError> {
    let path = path.as_ref();
    let mut file = fs::OpenOptions::new().write(true).open(path).wrap_open(path)?;
    file.write_all(data.as_bytes()).wrap_write(path, data)
}

pub fn write_cgroup_file<P: AsRef<Path>, T: ToString>(
    path: P,
    data: T,
) -> Result<(), WrappedIoError> {
    write_cgroup_file_str(path, &data.to_string())
}

pub fn read_cgroup_file<P: AsRef<Path>>(path: P) -> Result<String, WrappedIoError> {
    let path = path.as_ref();
    fs::read_to_string(path).wrap_read(path)
}

#[derive(thiserror::Error, Debug)]
pub enum GetCgroupSetupError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("non default cgroup root not supported")]
    NonDefault,
    #[error("failed to detect cgroup setup")]
    FailedToDetect,
}

/// Determines whether the host runs a pure v2 hierarchy (unified), a pure v1
/// hierarchy (legacy) or v1 with an empty unified mount next to it (hybrid).
/// Hybrid hosts are driven through their v1 controllers.
pub fn get_cgroup_setup_with_root(root_path: &Path) -> Result<CgroupSetup, GetCgroupSetupError> {
    if !root_path.exists() {
        return Err(GetCgroupSetupError::NonDefault);
    }
    let fs_type = |path: &Path| {
        statfs(path)
            .map(|stat| stat.filesystem_type())
            .map_err(std::io::Error::from)
            .wrap_other(path)
    };

    match fs_type(root_path)? {
        CGROUP2_SUPER_MAGIC => Ok(CgroupSetup::Unified),
        TMPFS_MAGIC => {
            let unified = root_path.join("unified");
            if unified.exists() && fs_type(&unified)? == CGROUP2_SUPER_MAGIC {
                Ok(CgroupSetup::Hybrid)
            } else {
                Ok(CgroupSetup::Legacy)
            }
        }
        _ => Err(GetCgroupSetupError::FailedToDetect),
    }
}

pub fn get_cgroup_setup() -> Result<CgroupSetup, GetCgroupSetupError> {
    get_cgroup_setup_with_root(Path::new(DEFAULT_CGROUP_ROOT))
}

#[derive(thiserror::Error, Debug)]
pub enum CreateCgroupSetupError {
    #[error("cgroup setup: {0}")]
    Setup(#[from] GetCgroupSetupError),
    #[error("v1 error: {0}")]
    V1(#[from] v1::manager::V1ManagerError),
    #[error("v2 error: {0}")]
    V2(#[from] v2::manager::V2ManagerError),
    #[error("failed to read cgroup membership of process {pid}: {err}")]
    ProcessCgroup { pid: i32, err: procfs::ProcError },
    #[error("process {0} is not a member of any cgroup hierarchy")]
    NoMembership(i32),
}

#[derive(Clone, Debug)]
pub struct CgroupConfig {
    /// Path of the cgroup relative to the hierarchy root.
    pub cgroup_path: PathBuf,
    pub container_name: String,
}

/// Manager for the cgroup a container is placed in at creation.
pub fn create_cgroup_manager(
    config: CgroupConfig,
) -> Result<AnyCgroupManager, CreateCgroupSetupError> {
    let setup = get_cgroup_setup()?;
    tracing::debug!(container = %config.container_name, ?setup, "creating cgroup manager");
    let manager = match setup {
        CgroupSetup::Legacy | CgroupSetup::Hybrid => {
            AnyCgroupManager::V1(v1::manager::Manager::new(&config.cgroup_path)?)
        }
        CgroupSetup::Unified => AnyCgroupManager::V2(v2::manager::Manager::new(
            PathBuf::from(DEFAULT_CGROUP_ROOT),
            config.cgroup_path,
        )?),
    };
    Ok(manager)
}

/// Builds a manager for the cgroup the given process currently lives in. This
/// is how `update` and `stats` reach a container whose cgroup path was chosen
/// by someone else.
pub fn create_cgroup_manager_for_pid(
    pid: Pid,
) -> Result<AnyCgroupManager, CreateCgroupSetupError> {
    let raw = pid.as_raw();
    let cgroups = Process::new(raw)
        .and_then(|p| p.cgroups())
        .map_err(|err| CreateCgroupSetupError::ProcessCgroup { pid: raw, err })?;

    match get_cgroup_setup()? {
        CgroupSetup::Unified => {
            let entry = cgroups
                .into_iter()
                .find(|c| c.hierarchy == 0)
                .ok_or(CreateCgroupSetupError::NoMembership(raw))?;
            Ok(AnyCgroupManager::V2(v2::manager::Manager::new(
                PathBuf::from(DEFAULT_CGROUP_ROOT),
                PathBuf::from(entry.pathname),
            )?))
        }
        CgroupSetup::Legacy | CgroupSetup::Hybrid => {
            let memberships: Vec<(Vec<String>, PathBuf)> = cgroups
                .into_iter()
                .filter(|c| c.hierarchy != 0)
                .map(|c| (c.controllers, PathBuf::from(c.pathname)))
                .collect();
            if memberships.is_empty() {
                return Err(CreateCgroupSetupError::NoMembership(raw));
            }
            Ok(AnyCgroupManager::V1(v1::manager::Manager::from_memberships(
                &memberships,
            )?))
        }
    }
}

/// Members of the cgroup at `path` and of every cgroup below it.
pub fn get_all_pids(path: &Path) -> Result<Vec<Pid>, WrappedIoError> {
    let mut pids = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let procs = dir.join(CGROUP_PROCS);
        if procs.exists() {
            let file = File::open(&procs).wrap_open(&procs)?;
            for line in BufReader::new(file).lines() {
                let line = line.wrap_read(&procs)?;
                let pid = line
                    .trim()
                    .parse::<i32>()
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
                    .wrap_other(&procs)?;
                pids.push(Pid::from_raw(pid));
            }
        }
        for entry in fs::read_dir(&dir).wrap_read(&dir)? {
            let child = entry.wrap_read(&dir)?.path();
            if child.is_dir() {
                pending.push(child);
            }
        }
    }
    tracing::debug!(path = %path.display(), count = pids.len(), "collected cgroup members");
    Ok(pids)
}

/// Kills every process listed in `cgroup.procs` of the given cgroup.
pub(crate) fn kill_procs(cgroup: &Path) -> Result<(), WrappedIoError> {
    let procs_path = cgroup.join(CGROUP_PROCS);
    let procs = read_cgroup_file(&procs_path)?;
    for line in procs.lines() {
        if let Ok(pid) = line.trim().parse::<i32>() {
            let _ = nix::sys::signal::kill(Pid::from_raw(pid), nix::sys::signal::SIGKILL);
        }
    }
    Ok(())
}

/// A cgroup directory can only be removed once the kernel has reaped every
/// member, which lags behind the SIGKILL a little.
pub(crate) fn delete_with_retry<P: AsRef<Path>>(
    path: P,
    retries: u32,
    limit_backoff: Duration,
) -> Result<(), WrappedIoError> {
    let path = path.as_ref();
    let mut attempts = 0;
    let mut delay = Duration::from_millis(10);

    loop {
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                attempts += 1;
                if attempts >= retries {
                    return Err(WrappedIoError::Other {
                        err,
                        path: path.to_path_buf(),
                    });
                }
            }
        }

        std::thread::sleep(delay);
        if delay < limit_backoff {
            delay *= 2;
        }
    }
}

pub(crate) trait PathBufExt {
    fn join_safely<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, JoinSafelyError>;
}

#[derive(thiserror::Error, Debug)]
pub enum JoinSafelyError {
    #[error("failed to strip prefix from {path}: {err}")]
    StripPrefix {
        err: StripPrefixError,
        path: PathBuf,
    },
}

impl PathBufExt for PathBuf {
    /// Joins `path` below `self` even when it is absolute.
    fn join_safely<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, JoinSafelyError> {
        let path = path.as_ref();
        let relative = match path.has_root() {
            true => path
                .strip_prefix("/")
                .map_err(|err| JoinSafelyError::StripPrefix {
                    err,
                    path: path.to_path_buf(),
                })?,
            false => path,
        };
        Ok(self.join(relative))
    }
}
