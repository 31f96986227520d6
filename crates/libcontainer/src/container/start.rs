use super::{Container, ContainerStatus};
use crate::error::LibcontainerError;
use crate::hooks;
use crate::start_socket::StartSocket;

impl Container {
    /// Starts a previously created container
    ///
    /// # Example
    ///
    /// ```no_run
    /// use libcontainer::container::Container;
    ///
    /// # fn main() -> Result<(), libcontainer::error::LibcontainerError> {
    /// let mut container = Container::load_by_id("/run/sifbox".as_ref(), "74f1a4cb3801")?;
    /// container.start()?;
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id()))]
    pub fn start(&mut self) -> Result<(), LibcontainerError> {
        let _lock = self.lock()?;
        self.reload()?;
        if !self.can_start() {
            return Err(self.incorrect_status("start"));
        }

        let config = self.config()?;
        let hooks = config.hooks.as_ref();
        // prestart is deprecated but still what most hook users rely on
        #[allow(deprecated)]
        hooks::run_hooks(hooks.and_then(|h| h.prestart().as_ref()), &self.state)?;

        StartSocket::new(self.start_socket_path()).notify_container_start()?;
        self.set_status(ContainerStatus::Running).save()?;

        // the process already runs, a failing poststart hook cannot undo that
        if let Err(err) = hooks::run_hooks(hooks.and_then(|h| h.poststart().as_ref()), &self.state) {
            tracing::warn!(%err, "poststart hook failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use anyhow::Result;
    use std::fs;

    #[test]
    fn test_start_requires_created() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("c1");
        fs::create_dir_all(&root)?;
        EngineConfig::default().save(&root)?;
        let mut container = Container::new("c1", ContainerStatus::Stopped, None, tmp.path(), &root)?;
        container.save()?;
        let err = container.start().unwrap_err();
        assert!(matches!(
            err,
            LibcontainerError::IncorrectStatus {
                status: ContainerStatus::Stopped,
                op: "start",
                ..
            }
        ));
        Ok(())
    }
}
