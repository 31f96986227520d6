//! Run a command inside a root filesystem directory. Build stages re-execute
//! the binary with this command for `%post` and `%test`, instances for their
//! start script.
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use libcontainer::rootfs::BindPath;
use libcontainer::rootfs_exec::RootfsExec;

/// Run a command in a root filesystem
#[derive(Parser, Debug)]
pub struct Exec {
    /// Working directory inside the root filesystem
    #[clap(long, default_value = "/")]
    pub pwd: PathBuf,
    /// Keep the root filesystem writable
    #[clap(short, long)]
    pub writable: bool,
    /// Start from a clean environment
    #[clap(short = 'e', long)]
    pub cleanenv: bool,
    /// Environment variable NAME=VALUE
    #[clap(long)]
    pub env: Vec<String>,
    /// Comma separated bind mounts, src[:dst[:ro|rw]]
    #[clap(short = 'B', long = "bind")]
    pub binds: Vec<String>,
    /// Map the caller to root in a new user namespace
    #[clap(short, long)]
    pub userns: bool,
    /// Stay alive as the supervisor of a background instance
    #[clap(long, hide = true)]
    pub instance: bool,

    /// Root filesystem directory
    #[clap(required = true)]
    pub rootfs: PathBuf,
    /// Command and its arguments
    #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Exec {
    fn rootfs_exec(self) -> Result<RootfsExec> {
        let mut binds = Vec::new();
        for list in &self.binds {
            binds.extend(BindPath::parse_list(list)?);
        }
        Ok(RootfsExec {
            rootfs: self.rootfs,
            command: self.command,
            pwd: self.pwd,
            writable: self.writable,
            cleanenv: self.cleanenv,
            env: self.env,
            binds,
            userns: self.userns,
        })
    }
}

pub fn exec(args: Exec) -> Result<i32> {
    let instance = args.instance;
    let run = args.rootfs_exec()?;
    tracing::debug!(?run, "executing in root filesystem");
    if instance {
        return Ok(run.run_instance()?);
    }
    Err(run.exec().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_command_line() -> Result<()> {
        let args = Exec::try_parse_from([
            "exec",
            "--pwd",
            "/",
            "--writable",
            "--cleanenv",
            "--env",
            "SINGULARITY_ENVIRONMENT=/.singularity.d/env/91-environment.sh",
            "-B",
            "/tmp/resolv.conf:/etc/resolv.conf,/data",
            "/tmp/rootfs",
            "/bin/sh",
            "-ex",
            "/.post.script",
        ])?;
        let run = args.rootfs_exec()?;
        assert!(run.writable && run.cleanenv && !run.userns);
        assert_eq!(run.command, ["/bin/sh", "-ex", "/.post.script"]);
        assert_eq!(run.binds.len(), 2);
        assert_eq!(run.binds[0].destination, PathBuf::from("/etc/resolv.conf"));
        assert_eq!(run.binds[1].source, PathBuf::from("/data"));
        Ok(())
    }

    #[test]
    fn test_invalid_bind() -> Result<()> {
        let args = Exec::try_parse_from(["exec", "-B", "/data:relative", "/tmp/rootfs", "true"])?;
        assert!(args.rootfs_exec().is_err());
        Ok(())
    }
}
