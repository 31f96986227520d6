use std::fs::{self, DirBuilder, File};
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use libcgroups::common::CgroupManager;
use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{self, Uid};
use oci_spec::runtime::Spec;

use super::monitor::{ERROR_PREFIX, MONITOR_LOG, READY};
use super::{validate_id, Container, ContainerStatus};
use crate::config::EngineConfig;
use crate::error::LibcontainerError;
use crate::instance::{InstanceFile, InstanceRegistry};
use crate::{hooks, utils};

/// Arguments the binary's hidden monitor command is reached with when no
/// other monitor is configured.
pub const DEFAULT_MONITOR_ARGS: &[&str] = &["oci", "monitor"];

/// Creates an OCI container from a bundle. The container process is forked
/// by a detached monitor and blocks until `start`.
///
/// # Example
///
/// ```no_run
/// use libcontainer::container::ContainerBuilder;
///
/// # fn main() -> Result<(), libcontainer::error::LibcontainerError> {
/// let container = ContainerBuilder::new("74f1a4cb3801", "/run/sifbox", "/var/lib/bundle")
///     .with_monitor("/usr/bin/sifbox", vec!["oci".into(), "monitor".into()])
///     .build()?;
/// println!("{} is {}", container.id(), container.status());
/// # Ok(())
/// # }
/// ```
pub struct ContainerBuilder {
    container_id: String,
    root_path: PathBuf,
    bundle: PathBuf,
    monitor_exe: PathBuf,
    monitor_args: Vec<String>,
    registry: Option<InstanceRegistry>,
}

impl ContainerBuilder {
    pub fn new(
        container_id: impl Into<String>,
        root_path: impl Into<PathBuf>,
        bundle: impl Into<PathBuf>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            root_path: root_path.into(),
            bundle: bundle.into(),
            monitor_exe: PathBuf::from("/proc/self/exe"),
            monitor_args: DEFAULT_MONITOR_ARGS.iter().map(|a| a.to_string()).collect(),
            registry: None,
        }
    }

    /// The command run as monitor, the container root is appended to `args`.
    pub fn with_monitor(mut self, exe: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.monitor_exe = exe.into();
        self.monitor_args = args;
        self
    }

    /// Records the container in an instance registry as well.
    pub fn with_registry(mut self, registry: InstanceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.container_id))]
    pub fn build(self) -> Result<Container, LibcontainerError> {
        validate_id(&self.container_id)?;
        let spec = self.load_spec()?;

        utils::create_dir_all_with_mode(&self.root_path, Uid::effective().as_raw(), Mode::S_IRWXU)?;
        let container_root = self.root_path.join(&self.container_id);
        DirBuilder::new()
            .mode(0o700)
            .create(&container_root)
            .map_err(|err| match err.kind() {
                ErrorKind::AlreadyExists => LibcontainerError::Exist(self.container_id.clone()),
                _ => LibcontainerError::Io {
                    path: container_root.clone(),
                    err,
                },
            })?;

        match self.create(&container_root, &spec) {
            Ok(container) => Ok(container),
            Err(err) => {
                tracing::error!(%err, "container creation failed, rolling back");
                self.rollback(&container_root);
                Err(err)
            }
        }
    }

    fn load_spec(&self) -> Result<Spec, LibcontainerError> {
        let path = self.bundle.join("config.json");
        if !path.exists() {
            return Err(LibcontainerError::InvalidInput(format!(
                "bundle {} has no config.json",
                self.bundle.display()
            )));
        }
        let spec = Spec::load(&path)?;
        let args = spec.process().as_ref().and_then(|p| p.args().as_ref());
        if args.map_or(true, |a| a.is_empty()) {
            return Err(LibcontainerError::InvalidInput(
                "config.json has no process arguments".to_owned(),
            ));
        }
        if spec.root().is_none() {
            return Err(LibcontainerError::InvalidInput(
                "config.json has no root".to_owned(),
            ));
        }
        Ok(spec)
    }

    fn create(&self, container_root: &Path, spec: &Spec) -> Result<Container, LibcontainerError> {
        let mut container = Container::new(
            &self.container_id,
            ContainerStatus::Creating,
            None,
            &self.bundle,
            container_root,
        )?;
        // held until the monitor reported, it never locks before the child exits
        let _lock = container.lock()?;

        let config = EngineConfig::from_spec(spec, &self.container_id, !utils::rootless_required());
        config.save(&container.root)?;

        container.state.annotations = spec.annotations().clone();
        container.state.attach_socket = Some(container.attach_socket_path());
        container.state.control_socket = Some(container.control_socket_path());
        container.set_creator(Uid::effective().as_raw()).save()?;

        let mut record = self.instance_file(&container, &config)?;
        if let Some(registry) = &self.registry {
            registry.create(&record)?;
        }

        self.spawn_monitor(&container)?;
        container.reload()?;
        if container.status() != ContainerStatus::Created {
            return Err(LibcontainerError::Monitor(
                self.container_id.clone(),
                format!("container is {} after setup", container.status()),
            ));
        }

        let hooks = config.hooks.as_ref();
        hooks::run_hooks(hooks.and_then(|h| h.create_runtime().as_ref()), &container.state)?;
        hooks::run_hooks(hooks.and_then(|h| h.create_container().as_ref()), &container.state)?;

        if let (Some(registry), Some(pid)) = (&self.registry, container.state.pid) {
            record.pid = pid;
            registry.update(&record)?;
        }
        tracing::debug!(pid = ?container.pid(), "container created");
        Ok(container)
    }

    fn instance_file(
        &self,
        container: &Container,
        config: &EngineConfig,
    ) -> Result<InstanceFile, LibcontainerError> {
        let log = container.log_path();
        Ok(InstanceFile {
            name: self.container_id.clone(),
            pid: 0,
            ppid: unistd::getpid().as_raw(),
            image: container.bundle().display().to_string(),
            ip: String::new(),
            log_out_path: log.clone(),
            log_err_path: log,
            start_socket: container.start_socket_path(),
            attach_socket: Some(container.attach_socket_path()),
            control_socket: Some(container.control_socket_path()),
            cgroup_configured: config.cgroup_path.is_some(),
            engine_config: serde_json::to_value(config)?,
            rootfs: None,
        })
    }

    /// Starts the monitor and waits for its one line report.
    fn spawn_monitor(&self, container: &Container) -> Result<(), LibcontainerError> {
        let log_path = container.root.join(MONITOR_LOG);
        let log = File::create(&log_path).map_err(LibcontainerError::io(&log_path))?;
        let mut child = Command::new(&self.monitor_exe)
            .args(&self.monitor_args)
            .arg(&container.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(log)
            .spawn()
            .map_err(LibcontainerError::io(&self.monitor_exe))?;

        let mut line = String::new();
        if let Some(stdout) = child.stdout.take() {
            BufReader::new(stdout).read_line(&mut line)?;
        }
        let line = line.trim_end();
        if line == READY {
            return Ok(());
        }
        let reason = match line.strip_prefix(ERROR_PREFIX) {
            Some(reason) => reason.to_owned(),
            None => {
                let _ = child.wait();
                last_line(&log_path).unwrap_or_else(|| "monitor exited".to_owned())
            }
        };
        Err(LibcontainerError::Monitor(self.container_id.clone(), reason))
    }

    fn rollback(&self, container_root: &Path) {
        if let Ok(container) = Container::load(container_root.to_path_buf()) {
            if let Some(pid) = container.pid() {
                if let Ok(manager) = container.cgroup_manager() {
                    if let Err(err) = manager.remove() {
                        tracing::warn!(%err, "failed to remove cgroup during rollback");
                    }
                }
                let _ = signal::kill(pid, Signal::SIGKILL);
            }
        }

        if let Some(registry) = &self.registry {
            let start_socket = container_root.join(crate::start_socket::START_FILE);
            match registry.get(&self.container_id) {
                Ok(record) if record.start_socket == start_socket => {
                    if let Err(err) = registry.delete(&self.container_id) {
                        tracing::warn!(%err, "failed to remove instance record");
                    }
                }
                _ => {}
            }
        }
        if let Err(err) = fs::remove_dir_all(container_root) {
            tracing::warn!(%err, path = ?container_root, "failed to remove container directory");
        }
    }
}

fn last_line(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    content
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(str::to_owned)
}
