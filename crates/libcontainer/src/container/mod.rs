//! Container management
/// OCI containers go through `create`, which spawns a monitor process that
/// owns the container process for its whole life, then `start`, `kill` and
/// `delete`. Every transition holds the container's lock file.
mod attach;
#[allow(clippy::module_inception)]
mod container;
mod create;
mod delete;
mod exec;
mod kill;
mod monitor;
mod pause;
mod start;
pub mod state;
mod update;

pub use container::{validate_id, Container, ContainerLock, ATTACH_FILE, CONTROL_FILE, LOG_FILE};
pub use create::{ContainerBuilder, DEFAULT_MONITOR_ARGS};
pub use monitor::run_monitor;
pub use state::{ContainerStatus, State, StateError};
