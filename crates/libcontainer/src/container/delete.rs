use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use libcgroups::common::CgroupManager;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::{Container, ContainerStatus};
use crate::error::LibcontainerError;
use crate::hooks;
use crate::instance::{InstanceError, InstanceRegistry};
use crate::utils;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const SIGKILL_GRACE: Duration = Duration::from_secs(5);

impl Container {
    /// Deletes the container
    ///
    /// A created container has its blocked process terminated first. With
    /// `force` a running or paused container is killed instead of refused.
    /// The container's record in `registry`, when given, goes as well.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use libcontainer::container::Container;
    ///
    /// # fn main() -> Result<(), libcontainer::error::LibcontainerError> {
    /// let mut container = Container::load_by_id("/run/sifbox".as_ref(), "74f1a4cb3801")?;
    /// container.delete(true, None)?;
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument(level = "debug", skip(self, registry), fields(id = %self.id()))]
    pub fn delete(
        &mut self,
        force: bool,
        registry: Option<&InstanceRegistry>,
    ) -> Result<(), LibcontainerError> {
        if !self.root.exists() {
            return Err(LibcontainerError::NotFound(self.id().to_owned()));
        }
        let _lock = self.lock()?;
        self.reload()?;
        let config = self.config()?;

        if !self.can_delete() {
            if !(force && self.can_kill()) {
                return Err(self.incorrect_status("delete"));
            }
            if let Some(pid) = self.pid() {
                if self.status() == ContainerStatus::Paused {
                    if let Ok(manager) = self.cgroup_manager() {
                        let _ = manager.freeze(libcgroups::common::FreezerState::Thawed);
                    }
                }
                terminate(pid, Signal::SIGKILL, SIGKILL_GRACE);
            }
        } else if self.status() == ContainerStatus::Created {
            if let Some(pid) = self.pid() {
                if !terminate(pid, Signal::SIGTERM, config.kill_timeout()) {
                    terminate(pid, Signal::SIGKILL, SIGKILL_GRACE);
                }
            }
        }
        self.set_status(ContainerStatus::Stopped);
        tracing::debug!("container status: {:?}", self.status());

        if let Some(hooks) = config.hooks.as_ref() {
            if let Err(err) = hooks::run_hooks(hooks.poststop().as_ref(), &self.state) {
                tracing::warn!(%err, "poststop hook failed");
            }
        }

        if config.cgroup_path.is_some() {
            match self.cgroup_manager() {
                Ok(manager) => {
                    if let Err(err) = manager.remove() {
                        tracing::warn!(%err, "failed to remove cgroup");
                    }
                }
                Err(err) => tracing::warn!(%err, "failed to open cgroup"),
            }
        }

        if let Some(registry) = registry {
            match registry.delete(self.id()) {
                Ok(()) | Err(InstanceError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        tracing::debug!("remove dir {:?}", self.root);
        fs::remove_dir_all(&self.root).map_err(LibcontainerError::io(&self.root))?;
        Ok(())
    }
}

/// Signals `pid` and waits up to `timeout` for it to go away. Returns
/// whether it did.
fn terminate(pid: Pid, sig: Signal, timeout: Duration) -> bool {
    if signal::kill(pid, sig).is_err() {
        return !utils::process_alive(pid);
    }
    let deadline = Instant::now() + timeout;
    while utils::process_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::instance::InstanceFile;
    use anyhow::Result;
    use oci_spec::runtime::{HookBuilder, HooksBuilder};
    use std::path::Path;
    use std::process::Command;

    fn container(dir: &Path, status: ContainerStatus, pid: Option<i32>) -> Result<Container> {
        let root = dir.join("c1");
        fs::create_dir_all(&root)?;
        let failing = HookBuilder::default().path("/bin/false").build()?;
        EngineConfig {
            hooks: Some(HooksBuilder::default().poststop(vec![failing]).build()?),
            ..Default::default()
        }
        .save(&root)?;
        let mut container = Container::new("c1", status, pid, dir, &root)?;
        container.save()?;
        Ok(container)
    }

    #[test]
    fn test_delete_stopped_container_twice() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = InstanceRegistry::with_base(tmp.path().join("instances"), "oci", "me", "host");
        registry.create(&InstanceFile {
            name: "c1".to_owned(),
            ..Default::default()
        })?;
        let mut c = container(tmp.path(), ContainerStatus::Stopped, None)?;

        c.delete(false, Some(&registry))?;
        assert!(!tmp.path().join("c1").exists());
        assert!(matches!(registry.get("c1"), Err(InstanceError::NotFound(_))));

        let err = c.delete(false, Some(&registry)).unwrap_err();
        assert!(matches!(err, LibcontainerError::NotFound(_)));
        Ok(())
    }

    #[test]
    fn test_delete_running_needs_force() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut child = Command::new("sleep").arg("30").spawn()?;
        let pid = child.id() as i32;
        let mut c = container(tmp.path(), ContainerStatus::Running, Some(pid))?;

        assert!(matches!(
            c.delete(false, None),
            Err(LibcontainerError::IncorrectStatus { op: "delete", .. })
        ));
        assert!(tmp.path().join("c1").exists());

        // reap concurrently so the killed child does not linger as a zombie
        let waiter = thread::spawn(move || child.wait());
        c.delete(true, None)?;
        assert!(!tmp.path().join("c1").exists());
        assert!(waiter.join().map(|s| s.is_ok()).unwrap_or(false));
        Ok(())
    }
}
