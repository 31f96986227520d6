//! Named background instances of a user: their on-disk records, launching,
//! listing and stopping them.
mod launch;
mod list;
mod registry;
mod stop;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use launch::{start_instance, LaunchOptions, START_ACTION};
pub use list::{render_json, render_table};
pub use registry::{InstanceRegistry, APP_SUBDIR, OCI_SUBDIR};
pub use stop::{stop_many, StopOptions, StopOutcome};

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("invalid instance name {0:?}: only letters, digits, '.', '_' and '-' are allowed")]
    InvalidName(String),
    #[error("instance {0} already exists")]
    Exists(String),
    #[error("no instance found with name {0}")]
    NotFound(String),
    #[error("no instance directory: neither XDG_RUNTIME_DIR nor HOME is set")]
    NoBaseDir,
    #[error("io error at {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("malformed instance file {path}: {err}")]
    Json {
        path: PathBuf,
        #[source]
        err: serde_json::Error,
    },
    #[error("invalid name pattern {0:?}")]
    Pattern(String),
    #[error("failed to launch {command}: {err}")]
    Launch {
        command: String,
        #[source]
        err: std::io::Error,
    },
    #[error("instance {name} exited during startup, see {log}")]
    ExitedEarly { name: String, log: PathBuf },
    #[error("failed to signal instance {name}: {err}")]
    Signal { name: String, err: nix::Error },
}

pub(crate) type Result<T> = std::result::Result<T, InstanceError>;

pub(crate) fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> InstanceError {
    let path = path.into();
    move |err| InstanceError::Io { path, err }
}

/// One running instance as recorded on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFile {
    pub name: String,
    pub pid: i32,
    pub ppid: i32,
    pub image: String,
    #[serde(default)]
    pub ip: String,
    pub log_out_path: PathBuf,
    pub log_err_path: PathBuf,
    pub start_socket: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_socket: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_socket: Option<PathBuf>,
    #[serde(default)]
    pub cgroup_configured: bool,
    #[serde(default)]
    pub engine_config: serde_json::Value,
    /// Sandbox the instance runs from when it was extracted from an image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
}

/// Instance names become file names.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(InstanceError::InvalidName(name.to_owned()))
    }
}
