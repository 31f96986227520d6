use std::path::PathBuf;

use crate::container::ContainerStatus;

#[derive(Debug, thiserror::Error)]
pub enum LibcontainerError {
    #[error("container {0} already exists")]
    Exist(String),
    #[error("container {0} does not exist")]
    NotFound(String),
    #[error("container {id} is {status}, cannot {op} it")]
    IncorrectStatus {
        id: String,
        status: ContainerStatus,
        op: &'static str,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("container {0} has no cgroup")]
    NoCgroup(String),
    #[error("container {0} did not come up: {1}")]
    Monitor(String, String),
    #[error("io error at {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error(transparent)]
    OtherIO(#[from] std::io::Error),
    #[error(transparent)]
    UnixOther(#[from] nix::Error),
    #[error(transparent)]
    MkdirWithMode(#[from] crate::utils::MkdirWithModeError),
    #[error(transparent)]
    Procfs(#[from] procfs::ProcError),
    #[error(transparent)]
    Spec(#[from] oci_spec::OciSpecError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    State(#[from] crate::container::StateError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Hook(#[from] crate::hooks::HookError),
    #[error(transparent)]
    Namespace(#[from] crate::namespaces::NamespaceError),
    #[error(transparent)]
    Rootfs(#[from] crate::rootfs::RootfsError),
    #[error(transparent)]
    StartSocket(#[from] crate::start_socket::StartSocketError),
    #[error(transparent)]
    Instance(#[from] crate::instance::InstanceError),
    #[error(transparent)]
    Signal(#[from] crate::signal::SignalError<String>),
    #[error(transparent)]
    CgroupCreate(#[from] libcgroups::common::CreateCgroupSetupError),
    #[error(transparent)]
    CgroupManager(#[from] libcgroups::common::AnyManagerError),
}

impl LibcontainerError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |err| LibcontainerError::Io { path, err }
    }

    /// Errors caused by what the caller asked for rather than by the host.
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            LibcontainerError::InvalidInput(_)
                | LibcontainerError::Spec(_)
                | LibcontainerError::Signal(_)
                | LibcontainerError::Instance(crate::instance::InstanceError::InvalidName(_))
        )
    }
}
