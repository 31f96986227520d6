//! Running one command inside a root filesystem directory. Build stages use
//! this through the `exec` entry point of the binary to run `%post` and
//! `%test`, instances use it to run the start script of a sandbox.
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{self, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Uid};

use crate::namespaces::{self, NamespaceError};
use crate::rootfs::{self, BindPath, RootfsError};

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host directories every command sees, bound only when the rootfs has the
/// directory.
const HOST_DIRS: &[&str] = &["/proc", "/sys", "/dev"];
/// Host variables kept by `--cleanenv`.
const KEPT_VARS: &[&str] = &["TERM", "LANG", "HOME"];

#[derive(Debug, thiserror::Error)]
pub enum RootfsExecError {
    #[error("no command given")]
    NoCommand,
    #[error("root filesystem {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("invalid environment entry {0:?}, expected NAME=VALUE")]
    InvalidEnv(String),
    #[error(transparent)]
    Namespace(#[from] NamespaceError),
    #[error(transparent)]
    Rootfs(#[from] RootfsError),
    #[error("failed to execute {command}: {err}")]
    Exec {
        command: String,
        #[source]
        err: io::Error,
    },
    #[error("instance supervisor failed: {0}")]
    Supervise(#[source] nix::Error),
}

impl RootfsExecError {
    /// Shell conventions: 127 when the command does not exist, 126 when it
    /// cannot be executed.
    pub fn exit_code(&self) -> i32 {
        match self {
            RootfsExecError::Exec { err, .. } if err.kind() == io::ErrorKind::NotFound => 127,
            RootfsExecError::Exec { .. } => 126,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RootfsExec {
    pub rootfs: PathBuf,
    pub command: Vec<String>,
    pub pwd: PathBuf,
    pub writable: bool,
    pub cleanenv: bool,
    /// `NAME=VALUE` entries applied over the inherited environment.
    pub env: Vec<String>,
    pub binds: Vec<BindPath>,
    /// Map the caller to root in a new user namespace even when it already
    /// is root.
    pub userns: bool,
}

/// Signals an instance supervisor passes on to the processes of its
/// session before leaving.
const FORWARDED: &[Signal] = &[Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGQUIT];

impl RootfsExec {
    /// The environment the command starts with, given the host's.
    pub fn environment<I>(&self, host: I) -> Result<BTreeMap<String, String>, RootfsExecError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: BTreeMap<String, String> = host
            .into_iter()
            .filter(|(k, _)| !self.cleanenv || KEPT_VARS.contains(&k.as_str()))
            .collect();
        if self.cleanenv || !env.contains_key("PATH") {
            env.insert("PATH".to_owned(), DEFAULT_PATH.to_owned());
        }
        for entry in &self.env {
            let (key, value) = entry
                .split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| RootfsExecError::InvalidEnv(entry.clone()))?;
            env.insert(key.to_owned(), value.to_owned());
        }
        Ok(env)
    }

    /// Sets up the mount namespace and replaces the current process with the
    /// command. Only returns on failure. The caller must be single threaded.
    pub fn exec(&self) -> RootfsExecError {
        match self.prepare() {
            Ok(mut cmd) => RootfsExecError::Exec {
                command: self.command[0].clone(),
                err: cmd.exec(),
            },
            Err(err) => err,
        }
    }

    /// Runs the command as an instance: this process stays in the prepared
    /// namespaces as the command's parent, reaps whatever exits in the
    /// session and keeps the instance alive after the command finished. A
    /// termination signal is forwarded to the session and ends it.
    pub fn run_instance(&self) -> Result<i32, RootfsExecError> {
        let mut signals = SigSet::empty();
        signals.add(Signal::SIGCHLD);
        for sig in FORWARDED {
            signals.add(*sig);
        }
        signals.thread_block().map_err(RootfsExecError::Supervise)?;

        let mut cmd = self.prepare()?;
        let command = self.command[0].clone();
        let child = match unsafe { unistd::fork() }.map_err(RootfsExecError::Supervise)? {
            ForkResult::Child => {
                let _ = signals.thread_unblock();
                let err = RootfsExecError::Exec {
                    command,
                    err: cmd.exec(),
                };
                let _ = writeln!(io::stderr(), "{err}");
                unsafe { libc::_exit(err.exit_code()) }
            }
            ForkResult::Parent { child } => child,
        };
        tracing::debug!(%child, "instance command started");

        loop {
            let sig = signals.wait().map_err(RootfsExecError::Supervise)?;
            if sig != Signal::SIGCHLD {
                tracing::debug!(?sig, "stopping instance");
                // only a session of our own is safe to signal as a whole
                let forwarded = if unistd::getpgrp() == unistd::getpid() {
                    signal::killpg(unistd::getpgrp(), sig)
                } else {
                    signal::kill(child, sig)
                };
                if let Err(err) = forwarded {
                    tracing::warn!(%err, "failed to forward {sig}");
                }
                return Ok(128 + sig as i32);
            }
            loop {
                match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                    Ok(WaitStatus::Exited(pid, code)) if pid == child => {
                        tracing::info!(code, "instance command exited, instance keeps running");
                    }
                    Ok(WaitStatus::Signaled(pid, sig, _)) if pid == child => {
                        tracing::info!(?sig, "instance command killed, instance keeps running");
                    }
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(err) => return Err(RootfsExecError::Supervise(err)),
                }
            }
        }
    }

    fn prepare(&self) -> Result<Command, RootfsExecError> {
        let program = self.command.first().ok_or(RootfsExecError::NoCommand)?;
        if !self.rootfs.is_dir() {
            return Err(RootfsExecError::NotADirectory(self.rootfs.clone()));
        }
        let env = self.environment(std::env::vars())?;

        if self.userns || !Uid::effective().is_root() {
            tracing::debug!("entering a root mapped user namespace");
            namespaces::enter_user_namespace(true)?;
        }
        namespaces::unshare(CloneFlags::CLONE_NEWNS)?;
        rootfs::make_private()?;
        rootfs::bind_mount(&self.rootfs, &self.rootfs, false)?;

        for dir in HOST_DIRS {
            let target = self.rootfs.join(dir.trim_start_matches('/'));
            if target.is_dir() {
                if let Err(err) = rootfs::bind_mount(Path::new(dir), &target, false) {
                    tracing::warn!(%err, "could not bind {dir}");
                }
            }
        }
        for bind in &self.binds {
            bind.mount(&self.rootfs)?;
        }
        if !self.writable {
            rootfs::remount_readonly(&self.rootfs)?;
        }
        rootfs::enter(&self.rootfs, &self.pwd)?;

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]).env_clear().envs(env);
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Vec<(String, String)> {
        [
            ("PATH", "/home/me/bin:/usr/bin"),
            ("HOME", "/home/me"),
            ("SECRET", "x"),
            ("TERM", "xterm"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    #[test]
    fn test_environment_inherited() -> anyhow::Result<()> {
        let exec = RootfsExec {
            env: vec!["SINGULARITY_LABELS=/.build.labels".to_owned(), "EMPTY=".to_owned()],
            ..Default::default()
        };
        let env = exec.environment(host())?;
        assert_eq!(env["PATH"], "/home/me/bin:/usr/bin");
        assert_eq!(env["SECRET"], "x");
        assert_eq!(env["SINGULARITY_LABELS"], "/.build.labels");
        assert_eq!(env["EMPTY"], "");
        Ok(())
    }

    #[test]
    fn test_environment_clean() -> anyhow::Result<()> {
        let exec = RootfsExec {
            cleanenv: true,
            env: vec!["FAKEROOTDONTTRYCHOWN=1".to_owned()],
            ..Default::default()
        };
        let env = exec.environment(host())?;
        assert_eq!(env["PATH"], DEFAULT_PATH);
        assert_eq!(env["TERM"], "xterm");
        assert!(!env.contains_key("SECRET"));
        assert_eq!(env["FAKEROOTDONTTRYCHOWN"], "1");
        Ok(())
    }

    #[test]
    fn test_invalid_env_entry() {
        let exec = RootfsExec {
            env: vec!["NOVALUE".to_owned()],
            ..Default::default()
        };
        assert!(matches!(
            exec.environment(host()),
            Err(RootfsExecError::InvalidEnv(_))
        ));
    }

    #[test]
    fn test_exec_refuses_bad_input_before_unsharing() {
        let err = RootfsExec::default().exec();
        assert!(matches!(err, RootfsExecError::NoCommand));
        assert_eq!(err.exit_code(), 1);

        let err = RootfsExec {
            rootfs: PathBuf::from("/does/not/exist"),
            command: vec!["/bin/true".to_owned()],
            ..Default::default()
        }
        .exec();
        assert!(matches!(err, RootfsExecError::NotADirectory(_)));
    }

    #[test]
    fn test_exit_codes() {
        let not_found = RootfsExecError::Exec {
            command: "nope".to_owned(),
            err: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(not_found.exit_code(), 127);
        let denied = RootfsExecError::Exec {
            command: "/etc/passwd".to_owned(),
            err: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(denied.exit_code(), 126);
    }
}
