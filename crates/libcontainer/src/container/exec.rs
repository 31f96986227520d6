use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use libcgroups::common::CgroupManager;
use nix::sched;
use nix::unistd::{self, Pid};

use super::Container;
use crate::error::LibcontainerError;
use crate::{namespaces, utils};

impl Container {
    /// Runs an additional process in the namespaces and root of a running
    /// container and waits for it. `env` entries extend the environment of
    /// the container process. The container state is left untouched.
    #[tracing::instrument(level = "debug", skip(self, env), fields(id = %self.id()))]
    pub fn exec(
        &mut self,
        args: &[String],
        env: &[String],
        cwd: Option<&Path>,
    ) -> Result<i32, LibcontainerError> {
        self.refresh_status()?;
        if !self.can_exec() {
            return Err(self.incorrect_status("exec"));
        }
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| LibcontainerError::InvalidInput("no command given".to_owned()))?;
        let pid = self.pid().ok_or_else(|| {
            LibcontainerError::InvalidInput(format!("container {} has no process", self.id()))
        })?;

        let spec = self.spec()?;
        let process = spec.process().as_ref();
        let mut environment = process
            .and_then(|p| p.env().as_deref())
            .map(utils::parse_env)
            .unwrap_or_default();
        environment.extend(utils::parse_env(env));
        let cwd = cwd
            .map(Path::to_path_buf)
            .or_else(|| process.map(|p| p.cwd().clone()))
            .unwrap_or_else(|| PathBuf::from("/"));

        let joined = namespaces::foreign_namespaces(pid)?;
        let root_path = format!("/proc/{pid}/root");
        let root = File::open(&root_path).map_err(LibcontainerError::io(root_path))?;

        let mut cmd = Command::new(program);
        cmd.args(rest).env_clear().envs(environment);
        unsafe {
            cmd.pre_exec(move || {
                for (fd, flag) in &joined {
                    sched::setns(fd, *flag)?;
                }
                unistd::fchdir(root.as_raw_fd())?;
                unistd::chroot(".")?;
                unistd::chdir(&cwd)?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|err| LibcontainerError::Io {
            path: PathBuf::from(program),
            err,
        })?;
        if self.config()?.cgroup_path.is_some() {
            let child_pid = Pid::from_raw(child.id() as i32);
            if let Err(err) = self.cgroup_manager().and_then(|m| Ok(m.add_task(child_pid)?)) {
                tracing::warn!(%err, "failed to add exec process to the container cgroup");
            }
        }
        let status = child.wait()?;
        Ok(exit_code(status))
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(255)
}
